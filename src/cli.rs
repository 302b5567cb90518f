use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::json;

#[derive(Parser, Debug)]
#[command(name = "matrix-imposter-bot")]
#[command(about = "Matrix imposter bot application service", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[arg(short, long, env = "CONFIG_PATH", default_value = "config.yaml")]
    pub config: PathBuf,

    #[arg(short, long, env = "REGISTRATION_PATH")]
    pub registration: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(about = "Generate a registration file for the Matrix homeserver")]
    GenerateRegistration {
        #[arg(short, long, default_value = "imposter-registration.yaml")]
        output: PathBuf,

        #[arg(long, default_value = "imposter")]
        id: String,

        #[arg(long, default_value = "http://localhost:9000")]
        url: String,

        #[arg(long, default_value = "imposter")]
        sender_localpart: String,

        #[arg(long, default_value = "example.org")]
        domain: String,
    },

    #[command(about = "Validate the configuration file")]
    ValidateConfig,
}

/// Registration for the homeserver; the bot claims only its own user id.
pub fn generate_registration(id: &str, url: &str, sender_localpart: &str, domain: &str) -> String {
    let registration = json!({
        "id": id,
        "url": url,
        "as_token": generate_token(),
        "hs_token": generate_token(),
        "sender_localpart": sender_localpart,
        "rate_limited": false,
        "namespaces": {
            "users": [{
                "exclusive": true,
                "regex": format!("@{}:{}", regex::escape(sender_localpart), regex::escape(domain))
            }],
            "aliases": [],
            "rooms": []
        }
    });

    serde_yaml::to_string(&registration).unwrap_or_default()
}

fn generate_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    #[test]
    fn generate_registration_produces_distinct_tokens() {
        let yaml = generate_registration("imposter", "http://localhost:9000", "imposter", "example.org");
        let parsed: Value = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed["id"], "imposter");
        assert_eq!(parsed["sender_localpart"], "imposter");
        assert_eq!(parsed["namespaces"]["users"][0]["regex"], "@imposter:example\\.org");
        let as_token = parsed["as_token"].as_str().unwrap();
        let hs_token = parsed["hs_token"].as_str().unwrap();
        assert_eq!(as_token.len(), 32);
        assert_ne!(as_token, hs_token);
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["matrix-imposter-bot", "-c", "bot.yaml", "validate-config"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("bot.yaml"));
        assert!(matches!(cli.command, Some(Commands::ValidateConfig)));
    }
}
