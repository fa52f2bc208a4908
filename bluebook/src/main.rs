use clap::Parser as ClapParser;
use std::{path::PathBuf, process, sync::Arc};

use log::{error, info};

use bluebook::{HeadlessDisplay, InputQueue, Interpreter, VmConfig, load_image};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Gzip-compressed Squeak image to run
    #[arg(help = "The .image.gz file to load")]
    image: PathBuf,

    /// Method cache entries (power of two)
    #[arg(long)]
    method_cache_size: Option<usize>,

    /// Initial object table size
    #[arg(long)]
    table_size: Option<usize>,

    /// Largest size the object table may grow to
    #[arg(long)]
    max_table_size: Option<usize>,

    /// Stop after this many bytecodes instead of running until quit
    #[arg(long)]
    bytecodes: Option<u64>,
}

impl Cli {
    fn config(&self) -> VmConfig {
        let mut config = VmConfig::default();
        if let Some(size) = self.method_cache_size {
            config.method_cache_size = size;
        }
        if let Some(size) = self.table_size {
            config.table_size = size;
        }
        if let Some(size) = self.max_table_size {
            config.table_max_size = size;
        }
        config
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let config = cli.config();

    let image = match load_image(&cli.image, &config) {
        Ok(image) => image,
        Err(err) => {
            error!("loading {}: {err}", cli.image.display());
            process::exit(1);
        }
    };
    let (width, height) = image.header.window_extent();
    info!(
        "loaded {} objects from {}",
        image.memory.occupied_count(),
        cli.image.display()
    );

    let input = Arc::new(InputQueue::new(config.typeahead_limit));
    let display = Box::new(HeadlessDisplay::new(width, height));
    let mut vm = match Interpreter::from_image(image, config, display, input) {
        Ok(vm) => vm,
        Err(err) => {
            error!("starting interpreter: {err}");
            process::exit(1);
        }
    };

    let result = match cli.bytecodes {
        Some(limit) => vm.run_for(limit).map(|_| ()),
        None => vm.run(),
    };
    if let Err(err) = result {
        error!("fatal: {err}");
        process::exit(1);
    }

    let cache = vm.state.method_cache.stats;
    info!(
        "{} bytecodes, method cache {} hits / {} misses",
        vm.bytecodes_executed(),
        cache.hits,
        cache.misses
    );
}
