mod annotate;
mod chat;
mod cli;
mod config;
mod logging;
mod output;
mod runtime;

use anyhow::Result;
use clap::Parser;

use crate::cli::{Cli, Command};
use crate::config::ChatlabelConfig;

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = if cli.verbose {
        true
    } else {
        logging::env_flag()
    };
    logging::init(verbose);
    let config = ChatlabelConfig::load(cli.config.as_deref())?;
    match cli.command {
        Command::Import { input, out, name } => chat::import(&input, &out, name),
        Command::Ask {
            chat,
            task,
            overlap,
        } => chat::ask(&config, &chat, &task, overlap),
        Command::FindTopic {
            chat,
            topic,
            overlap,
        } => chat::find(&config, &chat, &topic, overlap),
        Command::HideTopic {
            chat,
            topic,
            overlap,
        } => chat::hide(&config, &chat, &topic, overlap),
        Command::Count { request } => annotate::count(&config, &request),
        Command::Annotate { request } => annotate::annotate(&config, &request),
    }
}
