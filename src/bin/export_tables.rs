use std::env;
use std::path::PathBuf;
use std::process;

use paged_export::config::ExportSettings;
use paged_export::database::{connect_pg_pool, connect_sqlite_pool, DatabaseKind};
use paged_export::domains::export::{ExportService, PgRecordSource, RecordSource, SqliteRecordSource};
use paged_export::errors::{ExportError, ExportResult};

const USAGE: &str = "Usage:
  export_tables sitemap                      export comicseries and creator sitemaps
  export_tables images                       export comic stories missing image dimensions
  export_tables table <table> <pk> <output>  export one table into <output>";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Sitemap,
    Images,
    Table {
        table: String,
        pk: String,
        output: PathBuf,
    },
}

fn parse_command(args: &[String]) -> ExportResult<Command> {
    match args.first().map(String::as_str) {
        Some("sitemap") => Ok(Command::Sitemap),
        Some("images") => Ok(Command::Images),
        Some("table") => match &args[1..] {
            [table, pk, output] => Ok(Command::Table {
                table: table.clone(),
                pk: pk.clone(),
                output: PathBuf::from(output),
            }),
            _ => Err(ExportError::config("Missing required arguments: table, pk, outputPath")),
        },
        Some(other) => Err(ExportError::config(format!("Unknown command: {}", other))),
        None => Err(ExportError::config("Missing command")),
    }
}

/// Record source chosen by the scheme of `DATABASE_URL`
enum Source {
    Postgres(PgRecordSource),
    Sqlite(SqliteRecordSource),
}

impl Source {
    async fn connect(settings: &ExportSettings) -> ExportResult<Self> {
        match DatabaseKind::from_url(&settings.database_url)? {
            DatabaseKind::Postgres => {
                let pool = connect_pg_pool(&settings.database_url, &settings.pool).await?;
                Ok(Self::Postgres(PgRecordSource::new(pool)))
            }
            DatabaseKind::Sqlite => {
                let pool = connect_sqlite_pool(&settings.database_url, &settings.pool).await?;
                Ok(Self::Sqlite(SqliteRecordSource::new(pool)))
            }
        }
    }

    fn records(&self) -> &dyn RecordSource {
        match self {
            Self::Postgres(source) => source,
            Self::Sqlite(source) => source,
        }
    }

    async fn close(&self) {
        match self {
            Self::Postgres(source) => source.close().await,
            Self::Sqlite(source) => source.close().await,
        }
    }
}

async fn run(source: &dyn RecordSource, settings: &ExportSettings, command: Command) -> ExportResult<()> {
    let service = ExportService::from_settings(source, settings);

    match command {
        Command::Sitemap => {
            for sitemap in service.export_sitemaps(&settings.output_dir).await? {
                log::info!("[sitemap] {} ready with {} urls", sitemap.path.display(), sitemap.url_count);
            }
        }
        Command::Images => {
            let (path, completion) = service.export_story_images(&settings.output_dir).await?;
            log::info!(
                "[images] {} stories written to {}",
                completion.records_written,
                path.display()
            );
        }
        Command::Table { table, pk, output } => {
            let completion = service.export(&table, &pk, &output).await?;
            log::info!("[table] {}", serde_json::to_string(&completion)?);
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    paged_export::init_logging();

    let args: Vec<String> = env::args().skip(1).collect();
    let command = match parse_command(&args) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("{}\n\n{}", e, USAGE);
            process::exit(1);
        }
    };

    let settings = match ExportSettings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            log::error!("Invalid configuration: {}", e);
            process::exit(1);
        }
    };
    if let Ok(json) = serde_json::to_string(&settings) {
        log::debug!("Export settings: {}", json);
    }

    let source = match Source::connect(&settings).await {
        Ok(source) => source,
        Err(e) => {
            log::error!("Could not connect to the database: {}", e);
            process::exit(1);
        }
    };
    log::info!("[export] Reading from {}", source.records().source_name());

    let result = run(source.records(), &settings, command).await;
    source.close().await;

    match result {
        Ok(()) => log::info!("[export] Program finished."),
        Err(e) => {
            log::error!("[export] Failed: {}", e);
            process::exit(1);
        }
    }
}
