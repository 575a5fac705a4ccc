use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn, Level};

use neural_style::ml::data_util::{load_image, save_image};
use neural_style::{Network, StyleTransfer, StyleWeights, TransferOptions, Transformer};

//________________________________________________________________
#[derive(Parser, Debug)]
#[command(name = "neural_style", about = "Transfer the style of one image onto the content of another")]
struct Args {
    /// Image providing the texture statistics.
    #[arg(long)]
    style: PathBuf,

    /// Image providing the spatial structure.
    #[arg(long)]
    content: PathBuf,

    #[arg(long, default_value = "output.png")]
    output: PathBuf,

    /// Target length of the long image side.
    #[arg(long, default_value_t = 600)]
    length: usize,

    /// Style-to-content ratio.
    #[arg(long, default_value_t = 2e5)]
    ratio: f32,

    #[arg(long, default_value_t = 32)]
    n_iter: usize,

    /// VGG-16 parameter file; random filters are used without one.
    #[arg(long)]
    model: Option<PathBuf>,

    /// JSON file with `content` and `style` layer weights.
    #[arg(long)]
    weights: Option<PathBuf>,

    /// Seed for the random filter initialisation.
    #[arg(long, default_value_t = 0)]
    seed: u64,

    #[arg(short, long)]
    verbose: bool,
}
//________________________________________________________________
fn run(args: &Args) -> neural_style::Result<()> {
    let img_style = load_image(&args.style)?;
    let img_content = load_image(&args.content)?;

    let mut net = Network::vgg16(args.seed)?;
    match &args.model {
        Some(path) => net.load_parameters_from_file(path)?,
        None => warn!("no model file given, running with random VGG-16 filters"),
    }

    let weights = match &args.weights {
        Some(path) => StyleWeights::from_json_file(path)?,
        None => StyleWeights::default(),
    };

    let options = TransferOptions {
        length: args.length,
        ratio: args.ratio,
        n_iter: args.n_iter,
        verbose: args.verbose,
        ..TransferOptions::default()
    };

    let mut st = StyleTransfer::new(net, Transformer::default(), weights)?;
    let report = st.transfer_style(&img_style, &img_content, &options)?;
    info!("{} iterations, {} evaluations, loss {:.4e} -> {:.4e}", report.nit, report.nfev, report.initial_loss, report.final_loss);

    let img_out = st.get_generated()?;
    save_image(&img_out, &args.output)?;
    info!("saved {}", args.output.display());
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = if args.verbose { Level::INFO } else { Level::WARN };
    tracing_subscriber::fmt().with_max_level(level).init();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
