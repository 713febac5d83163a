//! Commands understood by the edge agent

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Verbs a coordinator (or an observer through it) can send to a terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandName {
    Start,
    Stop,
    SetMode,
    SetInterval,
    UpdateNodes,
    Restart,
    GetStatus,
    GetConfig,
    GetLogs,
    UpdateConfig,
    Buzzer,
    RotateLight,
}

impl CommandName {
    pub const ALL: [CommandName; 12] = [
        CommandName::Start,
        CommandName::Stop,
        CommandName::SetMode,
        CommandName::SetInterval,
        CommandName::UpdateNodes,
        CommandName::Restart,
        CommandName::GetStatus,
        CommandName::GetConfig,
        CommandName::GetLogs,
        CommandName::UpdateConfig,
        CommandName::Buzzer,
        CommandName::RotateLight,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CommandName::Start => "start",
            CommandName::Stop => "stop",
            CommandName::SetMode => "set_mode",
            CommandName::SetInterval => "set_interval",
            CommandName::UpdateNodes => "update_nodes",
            CommandName::Restart => "restart",
            CommandName::GetStatus => "get_status",
            CommandName::GetConfig => "get_config",
            CommandName::GetLogs => "get_logs",
            CommandName::UpdateConfig => "update_config",
            CommandName::Buzzer => "buzzer",
            CommandName::RotateLight => "rotate_light",
        }
    }
}

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown command: {0}")]
pub struct UnknownCommand(pub String);

impl FromStr for CommandName {
    type Err = UnknownCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // `change_config` is what older dashboards send
        if s == "change_config" {
            return Ok(CommandName::UpdateConfig);
        }
        CommandName::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| UnknownCommand(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_name_and_alias() {
        for name in CommandName::ALL {
            assert_eq!(name.as_str().parse::<CommandName>().unwrap(), name);
        }
        assert_eq!("change_config".parse::<CommandName>().unwrap(), CommandName::UpdateConfig);
        assert_eq!("self_destruct".parse::<CommandName>(), Err(UnknownCommand("self_destruct".into())));
    }
}
