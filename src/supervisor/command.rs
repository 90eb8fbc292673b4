use crate::error::AppError;
use crate::operation::OperationKind;
use serde::{Deserialize, Serialize};

/// A command handed to a [`super::CommandSupervisor`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OperationCommand {
    Install {
        package: String,
        #[serde(default)]
        bucket: Option<String>,
    },
    Update {
        package: String,
        #[serde(default)]
        force: bool,
    },
    UpdateAll,
    Uninstall {
        package: String,
    },
    ClearCache {
        package: String,
    },
    Scan {
        package: String,
        #[serde(default)]
        bucket: Option<String>,
    },
    Run {
        command: String,
    },
}

/// `""` and `none` (any case) mean "no bucket".
pub fn normalize_bucket(bucket: Option<&str>) -> Option<&str> {
    bucket
        .map(str::trim)
        .filter(|b| !b.is_empty() && !b.eq_ignore_ascii_case("none"))
}

fn qualified(package: &str, bucket: Option<&str>) -> String {
    match normalize_bucket(bucket) {
        Some(b) => format!("{}/{}", b, package),
        None => package.to_string(),
    }
}

impl OperationCommand {
    pub fn kind(&self) -> OperationKind {
        match self {
            OperationCommand::Install { .. } => OperationKind::Install,
            OperationCommand::Update { .. } => OperationKind::Update,
            OperationCommand::UpdateAll => OperationKind::UpdateAll,
            OperationCommand::Uninstall { .. } => OperationKind::Uninstall,
            OperationCommand::ClearCache { .. } => OperationKind::ClearCache,
            OperationCommand::Scan { .. } => OperationKind::Scan,
            OperationCommand::Run { .. } => OperationKind::Run,
        }
    }

    /// Human-readable title, e.g. `Installing git`.
    pub fn title(&self) -> String {
        match self {
            OperationCommand::Install { package, .. } => format!("Installing {}", package),
            OperationCommand::Update { package, force: false } => format!("Updating {}", package),
            OperationCommand::Update { package, force: true } => {
                format!("Force updating {}", package)
            }
            OperationCommand::UpdateAll => "Updating all packages".to_string(),
            OperationCommand::Uninstall { package } => format!("Uninstalling {}", package),
            OperationCommand::ClearCache { package } => format!("Clearing cache for {}", package),
            OperationCommand::Scan { package, .. } => format!("Scanning {}", package),
            OperationCommand::Run { command } => format!("Running {}", command),
        }
    }

    /// Arguments passed to the package manager. `None` for [`OperationCommand::Run`],
    /// which goes through the shell instead.
    pub fn package_args(&self) -> Option<Vec<String>> {
        let args = match self {
            OperationCommand::Install { package, bucket } => {
                vec!["install".to_string(), qualified(package, bucket.as_deref())]
            }
            OperationCommand::Update { package, force } => {
                let mut args = vec!["update".to_string(), package.clone()];
                if *force {
                    args.push("--force".to_string());
                }
                args
            }
            OperationCommand::UpdateAll => vec!["update".to_string(), "*".to_string()],
            OperationCommand::Uninstall { package } => vec!["uninstall".to_string(), package.clone()],
            OperationCommand::ClearCache { package } => {
                vec!["cache".to_string(), "rm".to_string(), package.clone()]
            }
            OperationCommand::Scan { package, bucket } => {
                vec!["virustotal".to_string(), qualified(package, bucket.as_deref())]
            }
            OperationCommand::Run { .. } => return None,
        };
        Some(args)
    }

    /// The command line as shown to the user, e.g. `scoop install main/git`.
    pub fn display(&self, package_manager: &str) -> String {
        match (self, self.package_args()) {
            (OperationCommand::Run { command }, _) => command.clone(),
            (_, Some(args)) => format!("{} {}", package_manager, args.join(" ")),
            (_, None) => package_manager.to_string(),
        }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        match self {
            OperationCommand::Install { package, .. }
            | OperationCommand::Update { package, .. }
            | OperationCommand::Uninstall { package }
            | OperationCommand::ClearCache { package }
            | OperationCommand::Scan { package, .. } => {
                if package.trim().is_empty() {
                    return Err(AppError::InvalidInputArgument(
                        "Package name must not be empty".to_string(),
                    ));
                }
                if package.chars().any(char::is_whitespace) {
                    return Err(AppError::InvalidInputArgument(format!(
                        "Package name must not contain whitespace: '{}'",
                        package
                    )));
                }
                Ok(())
            }
            OperationCommand::Run { command } if command.trim().is_empty() => Err(
                AppError::InvalidInputArgument("Command must not be empty".to_string()),
            ),
            OperationCommand::UpdateAll | OperationCommand::Run { .. } => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_package_manager_command_lines() {
        let install = OperationCommand::Install {
            package: "git".into(),
            bucket: Some("main".into()),
        };
        assert_eq!(install.display("scoop"), "scoop install main/git");
        assert_eq!(install.title(), "Installing git");

        let no_bucket = OperationCommand::Scan {
            package: "7zip".into(),
            bucket: Some("None".into()),
        };
        assert_eq!(no_bucket.display("scoop"), "scoop virustotal 7zip");

        let forced = OperationCommand::Update {
            package: "nodejs".into(),
            force: true,
        };
        assert_eq!(forced.display("scoop"), "scoop update nodejs --force");
        assert_eq!(forced.title(), "Force updating nodejs");

        assert_eq!(OperationCommand::UpdateAll.display("scoop"), "scoop update *");
        assert_eq!(
            OperationCommand::ClearCache { package: "git".into() }.display("scoop"),
            "scoop cache rm git"
        );
    }

    #[test]
    fn run_commands_bypass_the_package_manager() {
        let run = OperationCommand::Run {
            command: "scoop status".into(),
        };
        assert!(run.package_args().is_none());
        assert_eq!(run.display("scoop"), "scoop status");
        assert_eq!(run.kind(), OperationKind::Run);
    }

    #[test]
    fn validation_rejects_blank_input() {
        assert!(OperationCommand::Uninstall { package: " ".into() }.validate().is_err());
        assert!(OperationCommand::Install {
            package: "git; rm -rf".into(),
            bucket: None
        }
        .validate()
        .is_err());
        assert!(OperationCommand::Run { command: String::new() }.validate().is_err());
        assert!(OperationCommand::UpdateAll.validate().is_ok());
    }

    #[test]
    fn deserializes_tagged_commands() {
        let cmd: OperationCommand =
            serde_json::from_value(json!({"type": "clear-cache", "package": "git"})).unwrap();
        assert_eq!(cmd, OperationCommand::ClearCache { package: "git".into() });
        let cmd: OperationCommand = serde_json::from_value(json!({"type": "update-all"})).unwrap();
        assert_eq!(cmd.kind(), OperationKind::UpdateAll);
    }
}
