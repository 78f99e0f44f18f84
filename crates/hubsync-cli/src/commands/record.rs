use hubsync_core::{Record, RecordId};

use crate::cli::{GlobalArgs, RecordCommands};
use crate::commands::common::{
    format_record_lines, open_device, print_json, record_to_list_item, resolve_fields,
    RecordListItem,
};
use crate::error::CliError;

pub async fn run_record(command: RecordCommands, globals: &GlobalArgs) -> Result<(), CliError> {
    match command {
        RecordCommands::Put { table, id, fields } => {
            run_record_put(&table, id, fields.as_deref(), globals).await
        }
        RecordCommands::Delete { table, id } => run_record_delete(&table, id, globals).await,
        RecordCommands::List {
            table,
            include_deleted,
        } => run_record_list(&table, include_deleted, globals).await,
        RecordCommands::Tables => run_record_tables(globals).await,
    }
}

async fn run_record_put(
    table: &str,
    id: Option<i64>,
    fields: Option<&str>,
    globals: &GlobalArgs,
) -> Result<(), CliError> {
    let fields = resolve_fields(fields)?;
    let device = open_device(globals)?;
    let record = match id {
        Some(id) => {
            device
                .replica
                .put(table, Record::new(RecordId::new(id), 0, fields))
                .await?
        }
        None => device.replica.create(table, fields).await?,
    };

    if globals.json {
        return print_json(&record_to_list_item(&record));
    }
    println!("{}", record.id);
    Ok(())
}

async fn run_record_delete(table: &str, id: i64, globals: &GlobalArgs) -> Result<(), CliError> {
    let device = open_device(globals)?;
    let id = RecordId::new(id);
    if device.replica.get(table, id).await?.is_none() {
        return Err(CliError::RecordNotFound {
            table: table.to_string(),
            id: id.value(),
        });
    }
    let record = device.replica.delete(table, id).await?;

    if globals.json {
        return print_json(&record_to_list_item(&record));
    }
    println!("Deleted {table}/{id}");
    Ok(())
}

async fn run_record_list(
    table: &str,
    include_deleted: bool,
    globals: &GlobalArgs,
) -> Result<(), CliError> {
    let device = open_device(globals)?;
    let records = if include_deleted {
        device.replica.get_all(table).await?
    } else {
        device.replica.list_live(table).await?
    };

    if globals.json {
        let items = records
            .iter()
            .map(record_to_list_item)
            .collect::<Vec<RecordListItem>>();
        return print_json(&items);
    }
    if records.is_empty() {
        println!("No records in '{table}'.");
        return Ok(());
    }
    for line in format_record_lines(&records) {
        println!("{line}");
    }
    Ok(())
}

async fn run_record_tables(globals: &GlobalArgs) -> Result<(), CliError> {
    let device = open_device(globals)?;
    let stats = device.replica.table_stats().await?;

    if globals.json {
        return print_json(&stats);
    }
    if stats.is_empty() {
        println!("No tables yet.");
        return Ok(());
    }
    for stats in &stats {
        println!(
            "{:<20}  {} live  {} tombstoned",
            stats.table, stats.live, stats.tombstoned
        );
    }
    Ok(())
}
