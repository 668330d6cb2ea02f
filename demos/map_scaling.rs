use clap::Parser;
use mapdump::{Chunk, ChunkSize, ThreadPool};
use rayon::prelude::*;

#[derive(Debug, Parser)]
#[clap(version = "1.0")]
struct Opts {
    #[clap(short = 't', long, default_value = "1")]
    num_threads: usize,

    #[clap(short = 'n', long, default_value = "1000")]
    num_jobs: usize,

    #[clap(short = 'w', long, default_value = "100000")]
    work_per_job: usize,

    #[clap(short = 'c', long, default_value = "0")]
    min_chunk: usize,
}

fn work(n: usize) -> f64 {
    (0..n).map(|n| n as f64).sum()
}

fn report(name: &str, duration: f64, opts: &Opts) {
    println!();
    println!("{}", name);
    println!("total ................. {}s", duration);
    println!(
        "cpu-s ................. {}",
        duration * opts.num_threads as f64
    );
    println!(
        "cpu-ns / job / work ... {}",
        duration * opts.num_threads as f64 / opts.num_jobs as f64 / opts.work_per_job as f64 * 1e9
    );
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opts = Opts::parse();
    println!("{:?}", opts);

    for &(name, chunk) in &[
        ("mapdump::ThreadPool (guided)", ChunkSize::from(opts.min_chunk)),
        ("mapdump::ThreadPool (fixed)", ChunkSize::Fixed(opts.min_chunk.max(1))),
    ] {
        let pool = ThreadPool::new(opts.num_threads)?;
        let start = std::time::Instant::now();
        pool.map(opts.num_jobs, chunk, |c: Chunk| {
            for _ in c.range() {
                std::hint::black_box(work(opts.work_per_job));
            }
        });
        report(name, start.elapsed().as_secs_f64(), &opts);
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(opts.num_threads)
        .build()?;
    let data: Vec<_> = (0..opts.num_jobs).collect();
    let start = std::time::Instant::now();
    pool.install(|| {
        data.par_iter().for_each(|_| {
            std::hint::black_box(work(opts.work_per_job));
        });
    });
    report("rayon::par_iter", start.elapsed().as_secs_f64(), &opts);
    Ok(())
}
