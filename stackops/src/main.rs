mod application;
mod deploy;
mod ensure_permission;
mod escape_hatch;
mod interrupt;
mod logging;
mod manifest;
mod options;
mod orchestrator;
mod overrides;
mod patch;
mod template;
mod watch;
mod watching;

use anyhow::Result;
use application::{handle_result, runtime};
use clap::{CommandFactory as _, Parser, Subcommand};
use interrupt::set_up_process_interrupt_handler;
use options::Options;

fn main() {
    let args = Args::parse();
    handle_result(run_args(args));
}

fn run_args(args: Args) -> Result<()> {
    match &args.command {
        Commands::Deploy(subargs) => with_logging(&args.options, |interrupt_state| {
            runtime().block_on(deploy::deploy(&interrupt_state, subargs))
        }),
        Commands::Patch(subargs) => with_logging(&args.options, |_| patch::patch(subargs)),
        Commands::Override(subargs) => with_logging(&args.options, |_| overrides::apply(subargs)),
        Commands::EnsurePermission(subargs) => with_logging(&args.options, |interrupt_state| {
            runtime().block_on(ensure_permission::run(&interrupt_state, subargs))
        }),
        Commands::Watch(subargs) => with_logging(&args.options, |interrupt_state| {
            runtime().block_on(watch::watch(&interrupt_state, subargs))
        }),
        Commands::GenerateMan => (|| {
            let cmd = Args::command();
            let man = clap_mangen::Man::new(cmd);
            let mut buffer: Vec<u8> = Default::default();
            man.render(&mut buffer)?;
            println!("{}", String::from_utf8(buffer)?);
            Ok(())
        })(),
        Commands::GenerateMarkdown => {
            let opts = clap_markdown::MarkdownOptions::new().show_footer(false);
            let markdown: String = clap_markdown::help_markdown_custom::<Args>(&opts);
            println!("{}", markdown);
            Ok(())
        }
        Commands::GenerateCompletion { shell } => {
            let mut cmd = Args::command();
            clap_complete::generate(*shell, &mut cmd, "stackops", &mut std::io::stdout());
            Ok(())
        }
    }
}

/// Set up logging and the interrupt handler, run `f`, and tear logging
/// down again.
fn with_logging<T>(
    options: &Options,
    f: impl FnOnce(interrupt::InterruptState) -> Result<T>,
) -> Result<T> {
    let interrupt_state = set_up_process_interrupt_handler()?;
    let mut logger = logging::set_up(logging::Options {
        verbose: options.verbose,
        color: options.use_color(),
    })?;
    let r = f(interrupt_state);
    logger.tear_down()?;
    r
}

/// StackOps: patch compiled infrastructure templates and deploy them as stacks
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    options: Options,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upload artifacts and deploy the manifest's workload stack
    #[command()]
    Deploy(deploy::Args),

    /// Apply patch set files to a template and print the result
    #[command()]
    Patch(patch::Args),

    /// Apply legacy override files to a template and print the result
    #[command()]
    Override(overrides::Args),

    /// Make sure the deployed environment stack grants a permission,
    /// patching its template in place if it does not
    #[command()]
    EnsurePermission(ensure_permission::Args),

    /// Print filesystem events below the given paths
    #[command()]
    Watch(watch::Args),

    /// Generate markdown documentation for stackops
    #[command(hide = true)]
    GenerateMarkdown,

    /// Generate a manpage for stackops
    #[command(hide = true)]
    GenerateMan,

    /// Generate shell completion for stackops
    #[command(hide = true)]
    GenerateCompletion {
        /// The shell to generate completion for
        #[arg(long)]
        shell: clap_complete::Shell,
    },
}
