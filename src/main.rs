/**
 * MIT License
 *
 * podscan - Copyright (c) 2025 podscan developers
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to deal
 * in the Software without restriction, including without limitation the rights
 * to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
 * copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in all
 * copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
 * OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
 * SOFTWARE.
 */
use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::fs;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use podscanlib::api;
use podscanlib::config::Settings;
use podscanlib::db::Database;
use podscanlib::queue::{start_beat, JobQueue, QueueConfig};
use podscanlib::tasks::Runner;
use podscanlib::VERSION;

#[derive(Parser, Debug)]
#[clap(name = "podscan", author, version, about, long_about = None)]
struct Args {
    /// Config file to use instead of ./podscan.toml
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Listen address for the HTTP API, overriding the config
    #[arg(long)]
    api_addr: Option<String>,
    /// Comma-separated queue subset this process consumes, overriding the
    /// config. Defaults to all queues.
    #[arg(long, value_delimiter = ',')]
    queues: Option<Vec<String>>,
    /// Run the workers without the HTTP API
    #[arg(long)]
    no_api: bool,
}

fn main() -> Result<()> {
    lovely_env_logger::init_default();
    let args = Args::parse();

    let mut settings = Settings::load(args.config.as_deref())?;
    if let Some(api_addr) = args.api_addr {
        settings.api_addr = api_addr;
    }
    if let Some(queues) = args.queues {
        settings.worker_queues = queues;
    }

    fs::create_dir_all(&settings.audio_dir).context("failed to create audio dir")?;
    // opening once up front runs the schema migration before any worker does
    Database::connect(&settings.database_path).context("failed to open database")?;

    let runner = Arc::new(Runner::new(settings.clone()));
    let queue = JobQueue::start(runner, &QueueConfig::from_settings(&settings));
    let _beat = start_beat(
        queue.handle(),
        Duration::from_secs(settings.poll_interval_secs),
    );
    if !args.no_api {
        api::run_api_service(&settings, queue.handle())?;
        info!("podscan {VERSION} listening on {}", settings.api_addr);
    } else {
        info!("podscan {VERSION} running workers only");
    }
    info!("consuming queues: {}", settings.worker_queues.join(", "));

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("failed to install signal handler")?;
    rx.recv().ok();

    info!("shutting down");
    queue.shutdown();
    Ok(())
}
