use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::time::Instant;

use mkduprs::args::{Args, effective_threads};
use mkduprs::io::{BamSink, open_bam};
use mkduprs::library::{LibraryIdGenerator, log_metrics};
use mkduprs::utils::{format_duration, format_duration_verbose};
use mkduprs::MarkDuplicates;

#[cfg(not(windows))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let threads = effective_threads(&args);

    // Set rayon thread pool size (only affects parallel sorting)
    if threads > 1 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .ok();
    }

    let config = args.to_config()?;
    info!(
        "mkduprs: using {} threads{}, {} bytes of sort memory",
        threads,
        if args.single_threaded { " (single-threaded mode)" } else { "" },
        config.max_memory
    );

    let total_start = Instant::now();
    let mut reader = open_bam(&args.input)
        .with_context(|| format!("failed to open {}", args.input.display()))?;
    let header = reader
        .read_header()
        .with_context(|| format!("failed to read header of {}", args.input.display()))?;

    let mut markdup = MarkDuplicates::new(config, LibraryIdGenerator::from_header(&header)?)?;

    info!("finding positions of the duplicate reads in the file...");
    let find_start = Instant::now();
    let selection = markdup.find_duplicates(reader.records())?;
    info!(
        "found {} duplicate indices in {}",
        selection.duplicate_indices,
        format_duration_verbose(find_start.elapsed())
    );

    info!("marking duplicates...");
    let write_start = Instant::now();
    let mut reader = open_bam(&args.input)
        .with_context(|| format!("failed to reopen {}", args.input.display()))?;
    reader.read_header()?;

    let mut sink = BamSink::create(&args.output, &header)
        .with_context(|| format!("failed to create {}", args.output.display()))?;
    let stats = markdup.mark_duplicates(reader.records(), &mut sink)?;
    let written = sink.records_written();
    sink.finish()
        .with_context(|| format!("failed to finish {}", args.output.display()))?;
    markdup.cleanup()?;

    info!(
        "wrote {} of {} records in {:.1} sec",
        written,
        stats.records_read,
        write_start.elapsed().as_secs_f64()
    );
    if stats.duplicates_removed > 0 {
        info!("  removed {} duplicates", stats.duplicates_removed);
    }

    log_metrics(&markdup.into_metrics());

    let (total_m, total_s) = format_duration(total_start.elapsed());
    info!("done in {} min {} sec", total_m, total_s);

    Ok(())
}
