use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::cli::{Command, ComponentCommand, WorkflowCommand};

mod component;
mod workflow;

pub async fn run(command: Command, cancel: CancellationToken) -> Result<()> {
    match command {
        Command::Version => {
            println!("smithyctl {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::Component(ComponentCommand::Package(args)) => component::package(args).await,
        Command::Component(ComponentCommand::Build) => {
            warn!("component build is not implemented yet");
            Ok(())
        }
        Command::Component(ComponentCommand::Run) => {
            warn!("component run is not implemented yet");
            Ok(())
        }
        Command::Workflow(WorkflowCommand::Run(args)) => workflow::run(args, cancel).await,
    }
}
