//! CLI command definitions using clap
//!
//! - run: execute one script file in the sandbox
//! - check: compile script files and report invalid code
//! - ask: run the full execution loop against the model
//! - config: print the resolved configuration

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use codeloop::vm::VmBackend;

/// codeloop - runs model-written scripts in a bounded sandbox
#[derive(Parser, Debug)]
#[command(name = "codeloop")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute a script file in the sandbox
    Run {
        /// Script file to run
        script: PathBuf,

        /// Sandbox backend (inline, isolated); defaults to the configured one
        #[arg(short, long)]
        backend: Option<VmBackend>,

        /// Inject a global as name=json, e.g. --var 'order={"id":7}'
        #[arg(long = "var", value_name = "NAME=JSON")]
        vars: Vec<String>,
    },

    /// Compile script files and report invalid code
    Check {
        /// Glob patterns of script files
        #[arg(required = true)]
        patterns: Vec<String>,
    },

    /// Let the model solve a task by writing scripts
    Ask {
        /// Instructions for the model
        instructions: String,

        /// Expose the built-in host tools (current_time, read_file) to scripts
        #[arg(long)]
        script_tools: bool,
    },

    /// Print the resolved configuration
    Config,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_with_vars() {
        let cli = Cli::parse_from([
            "codeloop", "run", "script.rhai", "--backend", "isolated", "--var", "a=1", "--var", "b=\"x\"",
        ]);
        match cli.command {
            Commands::Run { script, backend, vars } => {
                assert_eq!(script, PathBuf::from("script.rhai"));
                assert_eq!(backend, Some(VmBackend::Isolated));
                assert_eq!(vars, vec!["a=1".to_string(), "b=\"x\"".to_string()]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_global_flags() {
        let cli = Cli::parse_from(["codeloop", "-v", "--config", "c.yml", "config"]);
        assert!(cli.is_verbose());
        assert_eq!(cli.config, Some(PathBuf::from("c.yml")));
        assert!(matches!(cli.command, Commands::Config));
    }

    #[test]
    fn test_parse_ask() {
        let cli = Cli::parse_from(["codeloop", "ask", "What time is it?", "--script-tools"]);
        assert!(matches!(cli.command, Commands::Ask { script_tools: true, .. }));
    }
}
