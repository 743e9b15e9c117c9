use futures::StreamExt;
use mergedb::recording::{RecordedEntry, read_recording};
use mergedb::{MergeDbConfig, MergeDbInstance};
use std::path::PathBuf;

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        return Err("missing command".into());
    }
    match args[1].as_str() {
        "recording" => match args.get(2).map(String::as_str) {
            Some("inspect") => cmd_recording_inspect(&args[3..]),
            Some("replay") => cmd_recording_replay(&args[3..]),
            Some(other) => Err(format!("unknown recording command: {other}")),
            None => Err("missing recording subcommand".into()),
        },
        other => {
            print_usage();
            Err(format!("unknown top-level command: {other}"))
        }
    }
}

fn cmd_recording_inspect(args: &[String]) -> Result<(), String> {
    let file = PathBuf::from(parse_flag_value(args, "--file").ok_or("--file is required")?);
    let frames = read_recording(&file).map_err(|e| format!("read {}: {e}", file.display()))?;
    for frame in frames {
        match &frame.entry {
            RecordedEntry::Batch(batch) => {
                let kinds = batch
                    .commands
                    .iter()
                    .map(|command| command.name())
                    .collect::<Vec<_>>()
                    .join(",");
                println!(
                    "{}\t{}\tbatch\t{}\t{}\t{}",
                    frame.sequence,
                    frame.timestamp_micros,
                    batch.commands.len(),
                    batch.attachments.len(),
                    kinds
                );
            }
            RecordedEntry::ClusterTransaction(entry) => {
                println!(
                    "{}\t{}\tcluster\t{}\t{}\t{}",
                    frame.sequence,
                    frame.timestamp_micros,
                    entry.proposal.commands.len(),
                    entry.commit_index,
                    entry.proposal.idempotency_key
                );
            }
        }
    }
    Ok(())
}

fn cmd_recording_replay(args: &[String]) -> Result<(), String> {
    let file = PathBuf::from(parse_flag_value(args, "--file").ok_or("--file is required")?);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("runtime: {e}"))?;
    runtime.block_on(async move {
        let db = MergeDbInstance::open(MergeDbConfig::default()).map_err(|e| e.to_string())?;
        let mut progress = Box::pin(db.replay(&file));
        let mut last = None;
        while let Some(step) = progress.next().await {
            let step = step.map_err(|e| format!("replay {}: {e}", file.display()))?;
            if !step.done {
                eprintln!("replayed {} entries, {} commands", step.entries, step.commands);
            }
            last = Some(step);
        }
        let last = last.unwrap_or_default();
        println!("documents\t{}", db.snapshot().document_count());
        println!("batches\t{}", last.entries);
        println!("commands\t{}", last.commands);
        println!("change_vector\t{}", db.database_change_vector());
        Ok(())
    })
}

fn parse_flag_value(args: &[String], flag: &str) -> Option<String> {
    for idx in 0..args.len() {
        if args[idx] == flag {
            return args.get(idx + 1).cloned();
        }
    }
    None
}

fn print_usage() {
    eprintln!("usage:");
    eprintln!("  mergedb recording inspect --file <recording>");
    eprintln!("  mergedb recording replay --file <recording>");
}
