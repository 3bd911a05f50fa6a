//! `chorus agents` and `chorus flows`.

use anyhow::Result;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use chorus_core::repository::AgentRepository;
use chorus_types::conversation::ConversationMode;

use crate::state::AppState;

const MODES: [ConversationMode; 4] = [
    ConversationMode::Fixed,
    ConversationMode::Dynamic,
    ConversationMode::Natural,
    ConversationMode::Smart,
];

pub async fn list_agents(state: &AppState, all: bool, json: bool) -> Result<()> {
    let agents = state.agents.list_agents(!all).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&agents)?);
        return Ok(());
    }

    if agents.is_empty() {
        println!();
        println!(
            "  {} No agents found. Declare some under {} in {}",
            style("i").blue().bold(),
            style("[[agents]]").yellow(),
            style(state.data_dir.join("chorus.toml").display()).yellow()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Role").fg(Color::White),
        Cell::new("Name").fg(Color::White),
        Cell::new("Model").fg(Color::White),
        Cell::new("Priority").fg(Color::White),
        Cell::new("Status").fg(Color::White),
        Cell::new("Capabilities").fg(Color::White),
    ]);

    for agent in &agents {
        let status = if agent.enabled {
            Cell::new("● enabled").fg(Color::Green)
        } else {
            Cell::new("○ disabled").fg(Color::Yellow)
        };
        table.add_row(vec![
            Cell::new(&agent.role),
            Cell::new(&agent.display_name),
            Cell::new(&agent.model),
            Cell::new(agent.priority),
            status,
            Cell::new(agent.capabilities.join(", ")),
        ]);
    }

    println!("{table}");
    Ok(())
}

pub async fn list_flows(state: &AppState, json: bool) -> Result<()> {
    let mut flows = Vec::new();
    for mode in MODES {
        if let Some(flow) = state.agents.get_flow(mode).await? {
            flows.push(flow);
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&flows)?);
        return Ok(());
    }

    if flows.is_empty() {
        println!();
        println!(
            "  {} No flows configured; fixed mode will use every enabled agent.",
            style("i").blue().bold()
        );
        println!();
        return Ok(());
    }

    for flow in &flows {
        println!();
        println!(
            "  {} {}",
            style(&flow.name).cyan().bold(),
            style(format!("({})", flow.mode)).dim()
        );
        for (i, stage) in flow.stages.iter().enumerate() {
            println!(
                "    {}. {} {} {} {}",
                i + 1,
                style(&stage.name).bold(),
                style(stage.execution).dim(),
                stage.roles.join(", "),
                style(format!("[{}]", stage.strategy)).dim(),
            );
        }
    }
    println!();
    Ok(())
}
