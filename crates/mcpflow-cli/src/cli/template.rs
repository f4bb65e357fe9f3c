//! CLI workflow template subcommands.

use anyhow::{Result, bail};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use super::{parse_id, parse_params, print_json};
use crate::state::AppState;

/// Template subcommands.
#[derive(Subcommand)]
pub enum TemplateCommand {
    /// Save a copy of an existing workflow as a reusable template.
    Create {
        /// Source workflow UUID.
        workflow_id: String,

        /// Template name.
        #[arg(long)]
        name: String,

        #[arg(long, default_value = "")]
        description: String,

        #[arg(long, default_value = "general")]
        category: String,

        #[arg(long, default_value = "cli")]
        author: String,
    },

    /// List templates.
    #[command(alias = "ls")]
    List {
        #[arg(long)]
        category: Option<String>,
    },

    /// Create a new draft workflow from a template.
    Instantiate {
        /// Template UUID.
        template_id: String,

        /// Name of the new workflow.
        #[arg(long)]
        name: String,

        /// Variable default override as key=value.
        #[arg(long, short = 'p')]
        param: Vec<String>,

        #[arg(long, default_value = "cli")]
        by: String,
    },

    /// Delete a template.
    #[command(alias = "rm")]
    Delete {
        /// Template UUID.
        id: String,
    },
}

/// Handle a template subcommand.
pub async fn handle_template_command(cmd: TemplateCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        TemplateCommand::Create {
            workflow_id,
            name,
            description,
            category,
            author,
        } => {
            let workflow_id = parse_id(&workflow_id, "workflow")?;
            let def = state.store.require_workflow(&workflow_id).await?;
            let template = state
                .store
                .create_template(def, &name, &description, &category, &author)
                .await?;

            if json {
                return print_json(&template);
            }
            println!();
            println!(
                "  {} Created template '{}'",
                style("*").green().bold(),
                style(&template.name).cyan()
            );
            println!("  ID: {}", template.id);
            println!("  Category: {}", template.category);
            println!("  Requires tools: {}", template.requirements.join(", "));
            println!();
            Ok(())
        }

        TemplateCommand::List { category } => {
            let templates = state.store.list_templates(category.as_deref());
            if json {
                return print_json(&templates);
            }
            if templates.is_empty() {
                println!();
                println!("  No templates found.");
                println!();
                return Ok(());
            }

            let mut table = Table::new();
            table
                .load_preset(presets::UTF8_FULL_CONDENSED)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec![
                    Cell::new("ID").fg(Color::Cyan),
                    Cell::new("Name"),
                    Cell::new("Category"),
                    Cell::new("Steps"),
                    Cell::new("Used"),
                    Cell::new("Author"),
                ]);
            for t in &templates {
                table.add_row(vec![
                    Cell::new(t.id),
                    Cell::new(&t.name),
                    Cell::new(&t.category),
                    Cell::new(t.workflow_definition.steps.len()),
                    Cell::new(t.usage_count),
                    Cell::new(&t.author),
                ]);
            }
            println!();
            println!("{table}");
            println!();
            Ok(())
        }

        TemplateCommand::Instantiate {
            template_id,
            name,
            param,
            by,
        } => {
            let template_id = parse_id(&template_id, "template")?;
            let overrides = parse_params(&param)?;
            let def = state
                .store
                .create_workflow_from_template(&template_id, &name, &overrides, &by)
                .await?;

            if json {
                return print_json(&def);
            }
            println!();
            println!(
                "  {} Created workflow '{}' from template",
                style("*").green().bold(),
                style(&def.name).cyan()
            );
            println!("  ID: {}", def.id);
            println!("  Status: {}", def.status);
            println!(
                "  Activate with: {}",
                style(format!("mcpflow workflow activate {}", def.id)).dim()
            );
            println!();
            Ok(())
        }

        TemplateCommand::Delete { id } => {
            let id = parse_id(&id, "template")?;
            if !state.store.delete_template(&id).await? {
                bail!("Template {id} not found");
            }
            if json {
                return print_json(&serde_json::json!({ "deleted": id.to_string() }));
            }
            println!();
            println!("  {} Deleted template {}", style("*").green().bold(), id);
            println!();
            Ok(())
        }
    }
}
