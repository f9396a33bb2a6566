use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::api::{Provider, Service};

#[derive(Parser)]
#[command(name = "pubdesk", about = "Generate, preview, save and publish articles through a publishing backend")]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, global = true, default_value = "pubdesk.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate the configuration file
    Validate,

    /// Show the backend's configuration (secrets masked)
    Config,

    /// List the models a provider offers
    Models { provider: Provider },

    /// Test the backend's credentials for a service
    Check { service: Service },

    /// Generate an article and print its preview
    Generate {
        /// Article title
        title: String,

        #[arg(long)]
        words: Option<u32>,

        #[arg(long)]
        images: Option<u32>,

        #[arg(long)]
        ai_model: Option<String>,

        #[arg(long)]
        image_model: Option<String>,

        /// HTML file whose formatting the article should imitate
        #[arg(long)]
        template: Option<PathBuf>,

        #[command(flatten)]
        then: FollowUp,
    },

    /// List generation history (or publish history with --published)
    History {
        #[arg(long)]
        published: bool,
    },

    /// Load a history record into the preview
    Load {
        record_id: String,

        #[command(flatten)]
        then: FollowUp,
    },

    /// Publish a history record's saved draft
    PublishDraft {
        record_id: String,

        /// Broadcast the article after publishing
        #[arg(long)]
        mass_send: bool,
    },

    /// Schedule a history record for publishing at a future time
    Schedule {
        record_id: String,

        /// Local time in the configured timezone, e.g. "2026-10-20 08:00"
        #[arg(long)]
        at: String,

        /// Broadcast the article when it is published
        #[arg(long)]
        mass_send: bool,
    },

    /// Keep history reconciled and print changes until interrupted
    Watch,

    /// Interactive control panel
    Panel,
}

/// Steps to run after an article lands in the preview.
#[derive(clap::Args, Debug, Clone, Copy)]
pub struct FollowUp {
    /// Save the article as a draft
    #[arg(long)]
    pub save: bool,

    /// Save, then publish the draft
    #[arg(long)]
    pub publish: bool,

    /// Broadcast after publishing (implies --publish)
    #[arg(long)]
    pub mass_send: bool,
}

impl FollowUp {
    pub fn publish(&self) -> bool {
        self.publish || self.mass_send
    }

    pub fn save(&self) -> bool {
        self.save || self.publish()
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn mass_send_implies_save_and_publish() {
        let cli = Cli::parse_from(["pubdesk", "generate", "Title", "--mass-send"]);
        let Some(Commands::Generate { then, .. }) = cli.command else {
            panic!("expected generate");
        };
        assert!(then.save() && then.publish());
    }

    #[test]
    fn schedule_args() {
        let cli = Cli::parse_from(["pubdesk", "-c", "x.toml", "schedule", "42", "--at", "2026-10-20 08:00"]);
        assert_eq!(cli.config, PathBuf::from("x.toml"));
        let Some(Commands::Schedule { record_id, at, mass_send }) = cli.command else {
            panic!("expected schedule");
        };
        assert_eq!((record_id.as_str(), at.as_str(), mass_send), ("42", "2026-10-20 08:00", false));
    }
}
