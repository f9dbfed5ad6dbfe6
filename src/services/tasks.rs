//! Validation of operator task submissions

use serde::Deserialize;
use serde_json::Value;

use crate::store::{TaskCommand, TaskKind};
use crate::{Error, Result};

/// Task submission body accepted by the management API
#[derive(Debug, Clone, Deserialize)]
pub struct TaskRequest {
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub parameters: Value,
}

/// Validate a task submission into a dispatchable command.
///
/// `get_params` needs at least one parameter name and `set_params` a
/// non-empty mapping of string values; reboot and factory reset carry no
/// payload and ignore whatever was submitted alongside them.
pub fn command_from_request(request: &TaskRequest) -> Result<TaskCommand> {
    let kind = TaskKind::parse(&request.task_type)?;
    let command = match kind {
        TaskKind::GetParams | TaskKind::SetParams => {
            TaskCommand::from_parts(kind, &request.parameters)?
        }
        TaskKind::Reboot => TaskCommand::Reboot,
        TaskKind::FactoryReset => TaskCommand::FactoryReset,
    };

    match &command {
        TaskCommand::GetParams { names } if names.is_empty() => Err(Error::invalid_task(
            "get_params requires at least one parameter name",
        )),
        TaskCommand::SetParams { values } if values.is_empty() => Err(Error::invalid_task(
            "set_params requires at least one parameter value",
        )),
        _ => Ok(command),
    }
}
