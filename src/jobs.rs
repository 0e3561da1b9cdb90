use crate::device_auth::DeviceAuthService;
use crate::entities;
use crate::errors::AppError;
use crate::settings::Settings;
use crate::storage;
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel, QueryFilter,
    Set,
};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

pub const CLEANUP_EXPIRED_DEVICE_AUTH: &str = "cleanup_expired_device_auth";
pub const CLEANUP_EXPIRED_SESSIONS: &str = "cleanup_expired_sessions";

/// Initialize and start the job scheduler with all background tasks
pub async fn init_scheduler(
    db: DatabaseConnection,
    device_auth: DeviceAuthService,
    settings: &Settings,
) -> Result<JobScheduler, AppError> {
    let sched = JobScheduler::new().await?;

    // Expired device authorizations, on the configured schedule
    let db_clone = db.clone();
    let service = device_auth.clone();
    let sweep_job = Job::new_async(
        settings.device_auth.sweep_schedule.as_str(),
        move |_uuid, _l| {
            let db = db_clone.clone();
            let service = service.clone();
            Box::pin(async move {
                run_recorded(&db, &service, CLEANUP_EXPIRED_DEVICE_AUTH).await;
            })
        },
    )?;
    sched.add(sweep_job).await?;

    // Expired approver sessions, every hour
    let db_clone = db.clone();
    let service = device_auth.clone();
    let sessions_job = Job::new_async("0 0 * * * *", move |_uuid, _l| {
        let db = db_clone.clone();
        let service = service.clone();
        Box::pin(async move {
            run_recorded(&db, &service, CLEANUP_EXPIRED_SESSIONS).await;
        })
    })?;
    sched.add(sessions_job).await?;

    sched.start().await?;

    info!(
        sweep_schedule = %settings.device_auth.sweep_schedule,
        "Job scheduler started with {} jobs", 2
    );

    Ok(sched)
}

async fn run_job(
    db: &DatabaseConnection,
    device_auth: &DeviceAuthService,
    job_name: &str,
) -> Result<u64, AppError> {
    match job_name {
        CLEANUP_EXPIRED_DEVICE_AUTH => device_auth
            .cleanup()
            .await
            .map_err(|e| AppError::Other(e.to_string())),
        CLEANUP_EXPIRED_SESSIONS => storage::cleanup_expired_sessions(db).await,
        _ => Err(AppError::Other(format!("Unknown job name: {}", job_name))),
    }
}

/// Scheduled run: failures are recorded and logged, never propagated.
async fn run_recorded(db: &DatabaseConnection, device_auth: &DeviceAuthService, job_name: &str) {
    info!("Running {} job", job_name);
    let execution_id = start_job_execution(db, job_name).await.ok();

    match run_job(db, device_auth, job_name).await {
        Ok(count) => {
            info!("Job {} removed {} records", job_name, count);
            if let Some(id) = execution_id {
                let _ = complete_job_execution(db, id, true, None, Some(count as i64)).await;
            }
        }
        Err(e) => {
            error!("Job {} failed: {}", job_name, e);
            if let Some(id) = execution_id {
                let _ = complete_job_execution(db, id, false, Some(e.to_string()), None).await;
            }
        }
    }
}

/// Record the start of a job execution
pub async fn start_job_execution(db: &DatabaseConnection, job_name: &str) -> Result<i64, AppError> {
    let execution = entities::job_execution::ActiveModel {
        job_name: Set(job_name.to_string()),
        started_at: Set(Utc::now().timestamp()),
        ..Default::default()
    };

    let result = execution.insert(db).await?;
    Ok(result.id)
}

/// Record the completion of a job execution
pub async fn complete_job_execution(
    db: &DatabaseConnection,
    execution_id: i64,
    success: bool,
    error_message: Option<String>,
    records_processed: Option<i64>,
) -> Result<(), AppError> {
    use entities::job_execution::{Column, Entity};

    if let Some(execution) = Entity::find()
        .filter(Column::Id.eq(execution_id))
        .one(db)
        .await?
    {
        let mut active = execution.into_active_model();
        active.completed_at = Set(Some(Utc::now().timestamp()));
        active.success = Set(Some(success as i64));
        active.error_message = Set(error_message);
        active.records_processed = Set(records_processed);
        active.update(db).await?;
    }

    Ok(())
}

/// Run a job by name right now, recording it like a scheduled run.
/// Returns the number of records the job removed.
pub async fn trigger_job_manually(
    db: &DatabaseConnection,
    device_auth: &DeviceAuthService,
    job_name: &str,
) -> Result<u64, AppError> {
    if job_name != CLEANUP_EXPIRED_DEVICE_AUTH && job_name != CLEANUP_EXPIRED_SESSIONS {
        return Err(AppError::Other(format!("Unknown job name: {}", job_name)));
    }

    info!("Manually triggering job: {}", job_name);
    let execution_id = start_job_execution(db, job_name).await?;

    match run_job(db, device_auth, job_name).await {
        Ok(count) => {
            info!(
                "Manually triggered job {} completed: {} records",
                job_name, count
            );
            complete_job_execution(db, execution_id, true, None, Some(count as i64)).await?;
            Ok(count)
        }
        Err(e) => {
            error!("Manually triggered job {} failed: {}", job_name, e);
            complete_job_execution(db, execution_id, false, Some(e.to_string()), None).await?;
            Err(e)
        }
    }
}
