//! `kra layers` commands.

use clap::{Args, Subcommand};
use kra_core::PushConfig;
use kra_push::{RemoteClient, RemoteLayer};

use crate::output;

#[derive(Subcommand)]
pub enum LayersCommand {
    /// List layers in the remote store
    #[command(alias = "list")]
    Ls(ListArgs),
}

#[derive(Args)]
pub struct ListArgs {
    /// Print the raw records as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(
    command: LayersCommand,
    config: PushConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        LayersCommand::Ls(args) => {
            let client = RemoteClient::new(&config)?;
            let layers = client.list_layers().await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&layers)?);
            } else {
                println!("{}", render(&layers));
            }
            Ok(())
        }
    }
}

fn render(layers: &[RemoteLayer]) -> comfy_table::Table {
    let mut table = output::new_table(&["ID", "SIZE", "OID", "REFCOUNT", "SHA256"]);
    for layer in layers {
        table.add_row([
            layer.id.clone(),
            layer
                .size
                .map(output::format_bytes)
                .unwrap_or_else(|| "-".to_string()),
            layer.oci_id.clone().unwrap_or_default(),
            layer
                .refcount
                .map(|n| n.to_string())
                .unwrap_or_else(|| "-".to_string()),
            layer.sha256.clone().unwrap_or_default(),
        ]);
    }
    table
}
