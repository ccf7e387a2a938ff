//! `kra images` commands.

use clap::{Args, Subcommand};
use kra_core::PushConfig;
use kra_push::{RemoteClient, RemoteImage};

use crate::output;

#[derive(Subcommand)]
pub enum ImagesCommand {
    /// List images in the remote catalog
    #[command(alias = "list")]
    Ls(ListArgs),
}

#[derive(Args)]
pub struct ListArgs {
    /// Only show image ids (one per line)
    #[arg(short, long)]
    pub quiet: bool,

    /// Print the raw records as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(
    command: ImagesCommand,
    config: PushConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        ImagesCommand::Ls(args) => list(args, config).await,
    }
}

async fn list(args: ListArgs, config: PushConfig) -> Result<(), Box<dyn std::error::Error>> {
    let client = RemoteClient::new(&config)?;
    let images = client.list_images().await?;

    if args.quiet {
        for image in &images {
            println!("{}", image.aid);
        }
        return Ok(());
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&images)?);
        return Ok(());
    }

    println!("{}", render(&images));
    Ok(())
}

fn render(images: &[RemoteImage]) -> comfy_table::Table {
    let mut table = output::new_table(&["AID", "SIZE", "REF"]);
    for image in images {
        let size = image
            .amd64
            .as_ref()
            .map(|arch| output::format_bytes(arch.size))
            .unwrap_or_else(|| "-".to_string());
        table.add_row([image.aid.as_str(), size.as_str(), image.reference.as_str()]);
    }
    table
}
