use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use plandex_core::AppConfig;
use plandex_errors::{ErrorHandler, exit_code};
use plandex_observe::init_logging;
use plandex_tools::fs::find_project_root;
use std::path::PathBuf;

mod commands;
mod context;
mod output;
mod prompt;

use commands::changes::{run_apply, run_debug, run_diff, run_reject, run_rewind};
use commands::context::{run_clear, run_load, run_ls, run_rm, run_update};
use commands::history::{run_convo, run_log, run_summary};
use commands::plans::{
    run_archive, run_branches, run_cd, run_checkout, run_current, run_delete_branch,
    run_delete_plan, run_new, run_plans, run_rename, run_unarchive,
};
use commands::settings::{
    run_config, run_model_packs, run_models, run_providers, run_set_config, run_set_model,
    run_usage,
};
use commands::turn::{run_build, run_chat, run_connect, run_continue, run_ps, run_stop, run_tell};
use context::CliContext;

#[derive(Parser)]
#[command(name = "plandex", version)]
#[command(about = "Plan and apply multi-file coding changes with AI models", long_about = None)]
struct Cli {
    /// Print machine-readable JSON instead of text.
    #[arg(long, global = true)]
    json: bool,

    /// Log debug output to stderr.
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new plan in this project.
    New(NewArgs),
    /// List plans in this project.
    Plans(PlansArgs),
    /// Switch the current plan by name or list number.
    Cd(PlanSelector),
    /// Show the current plan and branch.
    Current,
    /// Rename the current plan.
    Rename(RenameArgs),
    /// List branches of the current plan.
    Branches,
    /// Switch branch, creating it from the current one if needed.
    Checkout(CheckoutArgs),
    /// Delete a branch of the current plan.
    DeleteBranch(BranchArg),
    /// Load files, directories, urls, notes or piped data into context.
    Load(LoadArgs),
    /// List everything in context.
    Ls,
    /// Remove context by list number, range, path or glob.
    Rm(RmArgs),
    /// Remove all context.
    Clear,
    /// Refresh context whose source changed.
    Update(YesArgs),
    /// Send a prompt that plans and builds changes.
    Tell(TellArgs),
    /// Ask a question without planning changes.
    Chat(PromptArgs),
    /// Continue the plan from where the model stopped.
    Continue(ContinueArgs),
    /// Build pending changes that were planned but not built.
    Build,
    /// Show the conversation.
    Convo(ConvoArgs),
    /// Show the plan's commit history.
    Log,
    /// Show the latest conversation summary.
    Summary,
    /// Show pending changes as a unified diff.
    Diff(DiffArgs),
    /// Write pending changes to the project.
    Apply(ApplyArgs),
    /// Discard pending changes, all or by path.
    Reject(RejectArgs),
    /// Move the plan back to an earlier commit.
    Rewind(RewindArgs),
    /// Rejoin the stream running on the current branch.
    Connect,
    /// Stop the stream running on the current branch.
    Stop,
    /// List plans with a stream in flight.
    Ps,
    /// Run a command and let the model fix it until it passes.
    Debug(DebugArgs),
    /// Archive a plan.
    Archive(OptionalPlanSelector),
    /// Restore an archived plan.
    Unarchive(PlanSelector),
    /// Delete a plan, or every plan in the project.
    DeletePlan(DeletePlanArgs),
    /// Show plan settings.
    Config(DefaultArgs),
    /// Change a plan setting.
    SetConfig(SetConfigArgs),
    /// Choose a model pack, or the model for a single role.
    SetModel(SetModelArgs),
    /// List available models.
    Models,
    /// List available model packs.
    ModelPacks,
    /// Show which providers can serve the current model pack.
    Providers,
    /// Show token usage.
    Usage,
}

#[derive(Args)]
struct NewArgs {
    #[arg(short, long)]
    name: Option<String>,
}

#[derive(Args)]
struct PlansArgs {
    /// List archived plans instead.
    #[arg(long)]
    archived: bool,
}

#[derive(Args)]
struct PlanSelector {
    plan: String,
}

#[derive(Args)]
struct OptionalPlanSelector {
    /// Defaults to the current plan.
    plan: Option<String>,
}

#[derive(Args)]
struct RenameArgs {
    name: String,
}

#[derive(Args)]
struct CheckoutArgs {
    branch: String,
    /// Create the branch without asking.
    #[arg(short = 'y', long)]
    yes: bool,
}

#[derive(Args)]
struct BranchArg {
    branch: String,
}

#[derive(Args)]
struct LoadArgs {
    /// Paths, directories or urls. `-` reads piped data from stdin.
    paths: Vec<String>,
    #[arg(short, long)]
    recursive: bool,
    /// Load directory layouts as file names only.
    #[arg(long = "tree")]
    names_only: bool,
    /// Load definition maps instead of full files.
    #[arg(long = "map")]
    defs_only: bool,
    /// Load files even when ignored by .gitignore or .plandexignore.
    #[arg(short = 'f', long = "force-skip-ignore")]
    force_skip_ignore: bool,
    #[arg(short = 'n', long)]
    note: Option<String>,
    /// Image detail: high or low.
    #[arg(long, default_value = "high")]
    detail: String,
}

#[derive(Args)]
struct RmArgs {
    #[arg(required = true)]
    selectors: Vec<String>,
}

#[derive(Args)]
struct YesArgs {
    #[arg(short = 'y', long)]
    yes: bool,
}

#[derive(Args)]
struct PromptArgs {
    prompt: Option<String>,
    /// Read the prompt from a file.
    #[arg(short = 'f', long)]
    file: Option<PathBuf>,
}

#[derive(Args)]
struct TellArgs {
    #[command(flatten)]
    prompt: PromptArgs,
    /// Plan without building files.
    #[arg(long)]
    no_build: bool,
    /// Apply the result without asking.
    #[arg(long)]
    apply: bool,
}

#[derive(Args)]
struct ContinueArgs {
    #[arg(long)]
    no_build: bool,
}

#[derive(Args)]
struct ConvoArgs {
    /// Print messages without headers.
    #[arg(long)]
    plain: bool,
}

#[derive(Args)]
struct DiffArgs {
    /// Ask the server for its rendering.
    #[arg(long)]
    server: bool,
}

#[derive(Args)]
struct ApplyArgs {
    /// Answer yes to every question.
    #[arg(short = 'y', long)]
    yes: bool,
    /// Commit without asking.
    #[arg(short = 'c', long)]
    commit: bool,
    #[arg(long)]
    skip_commit: bool,
    #[arg(short = 'm', long = "message")]
    commit_msg: Option<String>,
    /// Never run `_apply.sh`.
    #[arg(long)]
    no_exec: bool,
    /// Run `_apply.sh` without asking.
    #[arg(long)]
    auto_exec: bool,
    /// Let the model fix a failing `_apply.sh`, up to this many tries.
    #[arg(long, num_args = 0..=1, default_missing_value = "5")]
    debug: Option<u32>,
}

#[derive(Args)]
struct RejectArgs {
    paths: Vec<String>,
    #[arg(short, long)]
    all: bool,
}

#[derive(Args)]
struct RewindArgs {
    /// Steps back from the latest commit, or a commit sha.
    target: Option<String>,
    /// Overwrite files edited since the plan last wrote them.
    #[arg(long)]
    force: bool,
}

#[derive(Args)]
struct DebugArgs {
    #[arg(short, long)]
    tries: Option<u32>,
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[derive(Args)]
struct DeletePlanArgs {
    plan: Option<String>,
    #[arg(long)]
    all: bool,
}

#[derive(Args)]
struct DefaultArgs {
    /// Use the defaults for new plans.
    #[arg(long)]
    default: bool,
}

#[derive(Args)]
struct SetConfigArgs {
    key: String,
    value: String,
    #[arg(long)]
    default: bool,
}

#[derive(Args)]
struct SetModelArgs {
    /// A model pack, or a role when a model id follows.
    target: String,
    model: Option<String>,
    #[arg(long)]
    default: bool,
}

fn main() {
    let cli = Cli::parse();
    let verbose = cli.verbose;
    if let Err(err) = run(cli) {
        eprintln!("{}", ErrorHandler::new().verbose(verbose).handle(&err));
        std::process::exit(exit_code(&err));
    }
}

fn run(cli: Cli) -> Result<()> {
    let cwd = std::env::current_dir()?;
    let root = find_project_root(&cwd);
    let config = AppConfig::load(root.as_deref().unwrap_or(&cwd))?;
    let _log_guard = init_logging(&config.log, cli.verbose)?;
    let ctx = CliContext::new(cwd, root, config, cli.json)?;

    match cli.command {
        Commands::New(args) => run_new(&ctx, args.name),
        Commands::Plans(args) => run_plans(&ctx, args.archived),
        Commands::Cd(args) => run_cd(&ctx, &args.plan),
        Commands::Current => run_current(&ctx),
        Commands::Rename(args) => run_rename(&ctx, &args.name),
        Commands::Branches => run_branches(&ctx),
        Commands::Checkout(args) => run_checkout(&ctx, &args.branch, args.yes),
        Commands::DeleteBranch(args) => run_delete_branch(&ctx, &args.branch),
        Commands::Load(args) => run_load(&ctx, args),
        Commands::Ls => run_ls(&ctx),
        Commands::Rm(args) => run_rm(&ctx, &args.selectors),
        Commands::Clear => run_clear(&ctx),
        Commands::Update(args) => run_update(&ctx, args.yes),
        Commands::Tell(args) => run_tell(&ctx, args),
        Commands::Chat(args) => run_chat(&ctx, args),
        Commands::Continue(args) => run_continue(&ctx, args.no_build),
        Commands::Build => run_build(&ctx),
        Commands::Convo(args) => run_convo(&ctx, args.plain),
        Commands::Log => run_log(&ctx),
        Commands::Summary => run_summary(&ctx),
        Commands::Diff(args) => run_diff(&ctx, args.server),
        Commands::Apply(args) => run_apply(&ctx, args),
        Commands::Reject(args) => run_reject(&ctx, args),
        Commands::Rewind(args) => run_rewind(&ctx, args),
        Commands::Connect => run_connect(&ctx),
        Commands::Stop => run_stop(&ctx),
        Commands::Ps => run_ps(&ctx),
        Commands::Debug(args) => run_debug(&ctx, args),
        Commands::Archive(args) => run_archive(&ctx, args.plan.as_deref()),
        Commands::Unarchive(args) => run_unarchive(&ctx, &args.plan),
        Commands::DeletePlan(args) => run_delete_plan(&ctx, args.plan.as_deref(), args.all),
        Commands::Config(args) => run_config(&ctx, args.default),
        Commands::SetConfig(args) => run_set_config(&ctx, &args.key, &args.value, args.default),
        Commands::SetModel(args) => run_set_model(&ctx, args),
        Commands::Models => run_models(&ctx),
        Commands::ModelPacks => run_model_packs(&ctx),
        Commands::Providers => run_providers(&ctx),
        Commands::Usage => run_usage(&ctx),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_tree_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn debug_keeps_the_command_line_verbatim() {
        let cli = Cli::try_parse_from(["plandex", "debug", "-t", "3", "cargo", "test", "--nocapture"])
            .expect("parse");
        let Commands::Debug(args) = cli.command else {
            panic!("expected debug");
        };
        assert_eq!(args.tries, Some(3));
        assert_eq!(args.command, vec!["cargo", "test", "--nocapture"]);
    }

    #[test]
    fn apply_debug_flag_defaults_to_five_tries() {
        let cli = Cli::try_parse_from(["plandex", "apply", "--debug"]).expect("parse");
        let Commands::Apply(args) = cli.command else {
            panic!("expected apply");
        };
        assert_eq!(args.debug, Some(5));
        assert!(!args.yes);
    }
}
