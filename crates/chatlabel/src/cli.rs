use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "chatlabel",
    about = "Chunked LLM prompting over chat transcripts and LLM-judged bulk labeling"
)]
pub struct Cli {
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    pub verbose: bool,
    /// TOML config file; `chatlabel.toml` in the working directory is used when present.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Convert a WhatsApp text export into a conversation JSON file.
    Import {
        input: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        name: Option<String>,
    },
    /// Run a task over a conversation and print the reconciled answer.
    Ask {
        chat: PathBuf,
        #[arg(long)]
        task: String,
        #[arg(long, default_value_t = 0)]
        overlap: usize,
    },
    /// Print the indices of the messages about a topic.
    FindTopic {
        chat: PathBuf,
        #[arg(long)]
        topic: String,
        #[arg(long, default_value_t = 0)]
        overlap: usize,
    },
    /// Hide the messages about a topic and rewrite the conversation file.
    HideTopic {
        chat: PathBuf,
        #[arg(long)]
        topic: String,
        #[arg(long, default_value_t = 0)]
        overlap: usize,
    },
    /// Count the documents an annotation request's filters select.
    Count {
        #[arg(long)]
        request: PathBuf,
    },
    /// Apply an annotation request to every matching document.
    Annotate {
        #[arg(long)]
        request: PathBuf,
    },
}
