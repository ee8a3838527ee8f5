use anyhow::Result;
use clap::{ArgGroup, Parser, Subcommand};
use fidx::areas::repository::Repository;
use fidx::commands::plumbing::debug_file_index::DebugFileIndexAction;
use is_terminal::IsTerminal;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "fidx",
    version = "0.1.0",
    author = "Sami Barbut-Dica",
    about = "A file index for version-control repositories",
    long_about = "Maps repository paths to small integer tokens, stored in append-only \
    data files that readers can map without locking.",
    help_template = r"
{name} {version} - {about}

USAGE:
    {usage}

OPTIONS:
    {all-args}
",
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(
        name = "init",
        about = "Initialize a new repository",
        long_about = "This command creates the .fidx directory and an empty store \
        in the current directory or at the specified path."
    )]
    Init {
        #[arg(index = 1, help = "The path to the repository")]
        path: Option<String>,
    },
    #[command(
        name = "add",
        about = "Add paths to the file index",
        long_about = "This command gives each path a token, printing `<token>: <path>`. \
        Paths already in the index keep their token."
    )]
    Add {
        #[arg(required = true, help = "The paths to add")]
        paths: Vec<String>,
    },
    #[command(
        name = "remove",
        about = "Remove paths from the file index",
        long_about = "This command removes each path, printing the token it had. \
        The remaining paths are renumbered."
    )]
    Remove {
        #[arg(required = true, help = "The paths to remove")]
        paths: Vec<String>,
    },
    #[command(
        name = "debug-file-index",
        about = "Inspect or maintain the file index",
        long_about = "Without options, this command lists every `<token>: <path>` pair. \
        At most one option can be given.",
        group(ArgGroup::new("action").multiple(false))
    )]
    DebugFileIndex {
        #[arg(long, group = "action", help = "Dump the docket")]
        docket: bool,
        #[arg(long, group = "action", help = "Dump the tree nodes")]
        tree: bool,
        #[arg(long, group = "action", help = "Show the token of a path")]
        path: Option<String>,
        #[arg(long, group = "action", help = "Show the path of a token")]
        token: Option<u32>,
        #[arg(long, group = "action", help = "Rewrite the tree file without unused bytes")]
        vacuum: bool,
        #[arg(long, group = "action", help = "Delete every garbage file now")]
        gc: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("FIDX_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
    colored::control::set_override(std::io::stdout().is_terminal());

    let cli = Cli::parse();
    let pwd = std::env::current_dir()?;

    match cli.command {
        Commands::Init { path } => {
            let path = path.unwrap_or_else(|| pwd.to_string_lossy().into_owned());
            let mut repository = Repository::new(&path, Box::new(std::io::stdout()))?;

            repository.init()?
        }
        Commands::Add { paths } => {
            let mut repository =
                Repository::new(&pwd.to_string_lossy(), Box::new(std::io::stdout()))?;

            repository.add(&paths)?
        }
        Commands::Remove { paths } => {
            let mut repository =
                Repository::new(&pwd.to_string_lossy(), Box::new(std::io::stdout()))?;

            repository.remove(&paths)?
        }
        Commands::DebugFileIndex {
            docket,
            tree,
            path,
            token,
            vacuum,
            gc,
        } => {
            let action = if docket {
                DebugFileIndexAction::Docket
            } else if tree {
                DebugFileIndexAction::Tree
            } else if let Some(path) = path {
                DebugFileIndexAction::Path(path)
            } else if let Some(token) = token {
                DebugFileIndexAction::Token(token)
            } else if vacuum {
                DebugFileIndexAction::Vacuum
            } else if gc {
                DebugFileIndexAction::Gc
            } else {
                DebugFileIndexAction::List
            };
            let mut repository =
                Repository::new(&pwd.to_string_lossy(), Box::new(std::io::stdout()))?;

            repository.debug_file_index(action)?
        }
    }

    Ok(())
}
