/// ExecTask: one command run inside an environment
use crate::config::BootstrapStep;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecTask {
    pub name: String,
    pub command: Vec<String>,
}

impl ExecTask {
    pub fn from_step(step: &BootstrapStep) -> Self {
        Self {
            name: step.name.clone(),
            command: step.command.clone(),
        }
    }

    pub fn new(name: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            name: name.into(),
            command,
        }
    }

    pub fn display_name(&self) -> String {
        if self.name.trim().is_empty() {
            self.command.join(" ")
        } else {
            self.name.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unnamed_task_displays_its_command() {
        let task = ExecTask::new("", vec!["apt-get".into(), "update".into()]);
        assert_eq!(task.display_name(), "apt-get update");

        let step = BootstrapStep::new("refresh", &["apt-get", "update"]);
        assert_eq!(ExecTask::from_step(&step).display_name(), "refresh");
    }
}
