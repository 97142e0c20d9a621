//! Status command implementation
//!
//! Lists every planned cell and whether a resumed session would skip it.

use anyhow::Result;
use async_trait::async_trait;
use clap::Args;
use console::style;
use fleece_bench::{CellState, PlannedCell, Session};
use serde_json::json;
use std::sync::Arc;
use tabled::{settings::Style, Table, Tabled};
use tracing::debug;

use crate::commands::run::MatrixArgs;
use crate::commands::Command;
use crate::config::Config;
use crate::utils::print_json;

#[derive(Args, Debug)]
pub struct StatusCommand {
    #[command(flatten)]
    pub matrix: MatrixArgs,

    /// Only list cells that still need to run
    #[arg(long)]
    pub pending: bool,
}

#[derive(Tabled)]
struct CellLine {
    model: String,
    prompt: String,
    repeat: u32,
    status: String,
    artifact: String,
}

impl From<&PlannedCell> for CellLine {
    fn from(cell: &PlannedCell) -> Self {
        let status = if is_complete(cell) { "complete" } else { "pending" };
        Self {
            model: cell.model.clone(),
            prompt: cell.prompt_id.clone(),
            repeat: cell.repeat_index,
            status: status.to_string(),
            artifact: cell.artifact.display().to_string(),
        }
    }
}

fn is_complete(cell: &PlannedCell) -> bool {
    cell.next_state == CellState::Skipped
}

#[async_trait]
impl Command for StatusCommand {
    async fn execute(&self, config: &Config, json_output: bool) -> Result<()> {
        debug!("Executing status command: {:?}", self);

        let mut overrides = self.matrix.overrides();
        overrides.resume = true;
        let config = config.merged(&overrides);

        let session_config = config.to_session_config()?;
        session_config.validate()?;
        let engine = Arc::new(config.engine()?);
        let monitor = Arc::new(config.monitor()?);
        let session = Session::new(session_config, engine, monitor);

        let mut cells = session.plan();
        let complete = cells.iter().filter(|c| is_complete(c)).count();
        let total = cells.len();
        if self.pending {
            cells.retain(|c| !is_complete(c));
        }

        if json_output {
            let data = json!({
                "output_dir": session.paths().root.display().to_string(),
                "mode": session.config().mode.as_str(),
                "total": total,
                "complete": complete,
                "cells": cells.iter().map(|c| json!({
                    "model": c.model,
                    "prompt_id": c.prompt_id,
                    "repeat_index": c.repeat_index,
                    "complete": is_complete(c),
                    "artifact": c.artifact.display().to_string(),
                })).collect::<Vec<_>>(),
            });
            return print_json(&data);
        }

        println!(
            "{} {} mode, {}",
            style("Session").bold().cyan(),
            session.config().mode,
            session.paths().root.display()
        );
        if !cells.is_empty() {
            let lines: Vec<CellLine> = cells.iter().map(CellLine::from).collect();
            let mut table = Table::new(lines);
            table.with(Style::rounded());
            println!("{}", table);
        }
        println!(
            "{}/{} cells complete, {} remaining",
            complete,
            total,
            total - complete
        );

        Ok(())
    }
}
