use hubsync_core::{Error, InboxEntryRef};

use crate::cli::GlobalArgs;
use crate::commands::common::{
    format_report_lines, format_sync_timestamp, open_device, open_engine, print_json,
};
use crate::error::CliError;

pub async fn run_push(globals: &GlobalArgs) -> Result<(), CliError> {
    let device = open_device(globals)?;
    let (engine, _) = open_engine(&device).await?;
    let entry = engine.push().await?;

    if globals.json {
        return print_json(&entry);
    }
    println!("Submitted {}", entry.path);
    Ok(())
}

pub async fn run_pull(globals: &GlobalArgs) -> Result<(), CliError> {
    let device = open_device(globals)?;
    let (engine, _) = open_engine(&device).await?;
    let report = engine.pull().await?;

    if globals.json {
        return print_json(&report);
    }
    for line in format_report_lines(&report) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_inbox_list(globals: &GlobalArgs) -> Result<(), CliError> {
    let device = open_device(globals)?;
    let (engine, _) = open_engine(&device).await?;
    let entries = engine.list_inbox().await?;

    if globals.json {
        return print_json(&entries);
    }
    if entries.is_empty() {
        println!("Inbox is empty.");
        return Ok(());
    }
    for entry in &entries {
        println!(
            "{}  {:<24}  {}",
            format_sync_timestamp(entry.submitted_at),
            entry.submitter,
            entry.path.trim_start_matches("inbox/")
        );
    }
    Ok(())
}

pub async fn run_merge(
    entry: Option<&str>,
    all: bool,
    globals: &GlobalArgs,
) -> Result<(), CliError> {
    let device = open_device(globals)?;
    let (engine, _) = open_engine(&device).await?;

    if all {
        let merged = engine.merge_inbox().await?;
        if globals.json {
            return print_json(&merged);
        }
        if merged.is_empty() {
            println!("Inbox is empty.");
        }
        for merged in &merged {
            println!("{}", merged.entry.path);
            for line in format_report_lines(&merged.report) {
                println!("  {line}");
            }
        }
        return Ok(());
    }

    let Some(entry) = entry else {
        return Err(CliError::Config("pass an inbox entry name or --all".to_string()));
    };
    let entry = InboxEntryRef::resolve(entry)?;
    let report = match engine.merge_entry(&entry).await {
        Ok(report) => report,
        Err(error) => {
            if let Error::InboxCleanup { report, .. } = &error {
                // The local commit already happened.
                for line in format_report_lines(report) {
                    println!("{line}");
                }
            }
            return Err(error.into());
        }
    };

    if globals.json {
        return print_json(&report);
    }
    for line in format_report_lines(&report) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_publish(globals: &GlobalArgs) -> Result<(), CliError> {
    let device = open_device(globals)?;
    let (engine, _) = open_engine(&device).await?;
    let published = engine.publish().await?;

    if globals.json {
        return print_json(&published);
    }
    println!(
        "Published master with {} records at {}",
        published.record_count,
        format_sync_timestamp(published.exported_at)
    );
    Ok(())
}
