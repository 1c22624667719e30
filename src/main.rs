use clap::{Parser, Subcommand};
use std::path::PathBuf;
use vault_rag::Result;
use vault_rag::commands::{
    clear_index, context, index_vault, init_config, query, show_stats, watch_vault,
};
use vault_rag::config::show_config;

#[derive(Parser)]
#[command(name = "vault-rag")]
#[command(about = "Semantic search and context retrieval over a markdown notes vault")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the configuration file, or show the current configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Index every document in the vault
    Index {
        /// Vault directory, overriding the configured one
        #[arg(long)]
        vault: Option<PathBuf>,
    },
    /// Search the index
    Query {
        /// Text to search for
        text: String,
    },
    /// Print the retrieved context for a question
    Context {
        /// Question or text to retrieve context for
        text: String,
        /// Maximum characters of context, defaults to the configured limit
        #[arg(long)]
        max_chars: Option<usize>,
    },
    /// Show index statistics
    Stats,
    /// Remove every indexed chunk
    Clear,
    /// Re-index documents as they change until interrupted
    Watch {
        /// Vault directory, overriding the configured one
        #[arg(long)]
        vault: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Config { show } => {
            if show {
                show_config()?;
            } else {
                init_config()?;
            }
        }
        Commands::Index { vault } => {
            index_vault(vault).await?;
        }
        Commands::Query { text } => {
            query(&text).await?;
        }
        Commands::Context { text, max_chars } => {
            context(&text, max_chars).await?;
        }
        Commands::Stats => {
            show_stats().await?;
        }
        Commands::Clear => {
            clear_index().await?;
        }
        Commands::Watch { vault } => {
            watch_vault(vault).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn cli_parsing() {
        let cli = Cli::try_parse_from(["vault-rag", "stats"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            assert!(matches!(parsed.command, Commands::Stats));
        }
    }

    #[test]
    fn index_with_vault_override() {
        let cli = Cli::try_parse_from(["vault-rag", "index", "--vault", "/notes"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            if let Commands::Index { vault } = parsed.command {
                assert_eq!(vault, Some(PathBuf::from("/notes")));
            } else {
                panic!("expected index command");
            }
        }
    }

    #[test]
    fn index_without_vault() {
        let cli = Cli::try_parse_from(["vault-rag", "index"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            assert!(matches!(parsed.command, Commands::Index { vault: None }));
        }
    }

    #[test]
    fn query_requires_text() {
        let cli = Cli::try_parse_from(["vault-rag", "query"]);
        assert!(cli.is_err());

        if let Err(err) = cli {
            assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
        }
    }

    #[test]
    fn query_with_text() {
        let cli = Cli::try_parse_from(["vault-rag", "query", "project alpha"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            if let Commands::Query { text } = parsed.command {
                assert_eq!(text, "project alpha");
            } else {
                panic!("expected query command");
            }
        }
    }

    #[test]
    fn context_with_max_chars() {
        let cli = Cli::try_parse_from(["vault-rag", "context", "deadline", "--max-chars", "500"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            if let Commands::Context { text, max_chars } = parsed.command {
                assert_eq!(text, "deadline");
                assert_eq!(max_chars, Some(500));
            } else {
                panic!("expected context command");
            }
        }
    }

    #[test]
    fn max_chars_must_be_a_number() {
        let cli = Cli::try_parse_from(["vault-rag", "context", "x", "--max-chars", "lots"]);
        assert!(cli.is_err());

        if let Err(err) = cli {
            assert_eq!(err.kind(), ErrorKind::ValueValidation);
        }
    }

    #[test]
    fn config_show_flag() {
        let cli = Cli::try_parse_from(["vault-rag", "config", "--show"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            if let Commands::Config { show } = parsed.command {
                assert!(show);
            }
        }
    }

    #[test]
    fn invalid_command() {
        let cli = Cli::try_parse_from(["vault-rag", "invalid"]);
        assert!(cli.is_err());

        if let Err(err) = cli {
            assert_eq!(err.kind(), ErrorKind::InvalidSubcommand);
        }
    }

    #[test]
    fn help_message() {
        let cli = Cli::try_parse_from(["vault-rag", "--help"]);
        assert!(cli.is_err());

        if let Err(err) = cli {
            assert_eq!(err.kind(), ErrorKind::DisplayHelp);
        }
    }
}
