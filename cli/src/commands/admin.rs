use crate::output::{list_json, print_list_table};
use clap::ValueEnum;
use jailrun_container::{LifecycleController, LifecycleError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ListFormat {
    Table,
    Json,
}

pub async fn list(
    controller: &LifecycleController,
    quiet: bool,
    format: ListFormat,
) -> Result<(), LifecycleError> {
    let states = controller.list().await?;

    if quiet {
        for state in &states {
            println!("{}", state.id);
        }
        return Ok(());
    }

    match format {
        ListFormat::Table => print_list_table(&states),
        ListFormat::Json => {
            let json = list_json(&states).map_err(|e| LifecycleError::Io(e.into()))?;
            println!("{}", json);
        }
    }
    Ok(())
}

pub async fn cleanup(controller: &LifecycleController, jail: &str) -> Result<(), LifecycleError> {
    controller.cleanup(jail).await
}

/// Body of the detached monitor process.
pub async fn monitor(controller: &LifecycleController, id: &str) -> Result<(), LifecycleError> {
    match controller.run_monitor(id).await? {
        Some(state) => {
            tracing::info!(container_id = %id, exit_code = ?state.exit_code, "Monitor exiting")
        }
        None => tracing::info!(container_id = %id, "Container deleted while monitored"),
    }
    Ok(())
}
