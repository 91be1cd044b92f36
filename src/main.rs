//! Standalone driver: reads an Arrow IPC file with `id` and `text`
//! columns, runs an instruction list per row through the dispatch layer,
//! and writes tab-separated answers plus a timing summary.

use std::fs::File;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use datafusion::arrow::array::{Array, ArrayRef, Int32Array, Int64Array, StringArray};
use datafusion::arrow::error::ArrowError;
use datafusion::arrow::ipc::reader::FileReader;
use tracing::info;
use tracing_subscriber::EnvFilter;

use quack_llm::chunk::answer_chunk;
use quack_llm::config::{Args, Mode};
use quack_llm::metrics;
use quack_llm::state::Dispatch;
use quack_llm::worker;

const DEFAULT_PROMPTS: [&str; 4] = [
    "What sound does this animal make?",
    "Reverse the name and capitalize it",
    "Is this animal typically a pet? Answer yes/no.",
    "Return the plural form.",
];

#[derive(Debug, thiserror::Error)]
enum DriverError {
    #[error("open {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },

    #[error("ipc file reader: {0}")]
    Ipc(ArrowError),

    #[error("read record batch {index}: {source}")]
    Record { index: usize, source: ArrowError },

    #[error("schema has no column {0:?}")]
    MissingColumn(&'static str),

    #[error("column {name:?} is {actual}; expected {expected}")]
    ColumnType {
        name: &'static str,
        actual: String,
        expected: &'static str,
    },

    #[error(transparent)]
    Llm(#[from] quack_llm::error::LlmError),
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), DriverError> {
    let prompts: Vec<String> = if args.prompts.is_empty() {
        DEFAULT_PROMPTS.iter().map(|p| p.to_string()).collect()
    } else {
        args.prompts.clone()
    };
    let parallel = args.parallel.unwrap_or_else(worker::default_parallelism);

    let start_wall = Instant::now();

    let dispatch = Arc::new(Dispatch::from_env()?);
    info!(mode = dispatch.mode().as_str(), parallel, "dispatch layer ready");

    let file = File::open(&args.input).map_err(|source| DriverError::Open {
        path: args.input.clone(),
        source,
    })?;
    let reader = FileReader::try_new(file, None).map_err(DriverError::Ipc)?;

    let schema = reader.schema();
    let id_idx = schema
        .index_of("id")
        .map_err(|_| DriverError::MissingColumn("id"))?;
    let text_idx = schema
        .index_of("text")
        .map_err(|_| DriverError::MissingColumn("text"))?;

    let mut printed_header = false;

    for (index, batch) in reader.enumerate() {
        let batch = batch.map_err(|source| DriverError::Record { index, source })?;
        if batch.num_rows() == 0 {
            continue;
        }

        let ids = extract_ids(batch.column(id_idx))?;
        let texts = batch
            .column(text_idx)
            .as_any()
            .downcast_ref::<StringArray>()
            .ok_or_else(|| DriverError::ColumnType {
                name: "text",
                actual: batch.column(text_idx).data_type().to_string(),
                expected: "utf8",
            })?
            .clone();

        let outputs = run_prompts(&dispatch, &texts, &prompts, parallel).await;

        if !printed_header {
            print_header(prompts.len());
            printed_header = true;
        }
        print_rows(&ids, &texts, &outputs, prompts.len());
    }

    print_summary(dispatch.mode(), start_wall.elapsed());
    Ok(())
}

async fn run_prompts(
    dispatch: &Arc<Dispatch>,
    texts: &StringArray,
    prompts: &[String],
    parallel: usize,
) -> Vec<StringArray> {
    if dispatch.mode() == Mode::Fused {
        // fused coalesces across prompts, so run the whole list at once
        let tasks = prompts.iter().map(|prompt| {
            let prompt_col = constant_prompts(texts, prompt);
            async move { answer_chunk(dispatch, texts, &prompt_col, parallel).await }
        });
        futures::future::join_all(tasks).await
    } else {
        let mut outputs = Vec::with_capacity(prompts.len());
        for prompt in prompts {
            let prompt_col = constant_prompts(texts, prompt);
            outputs.push(answer_chunk(dispatch, texts, &prompt_col, parallel).await);
        }
        outputs
    }
}

// constant instruction column whose validity mirrors the text column
fn constant_prompts(texts: &StringArray, prompt: &str) -> StringArray {
    (0..texts.len())
        .map(|row| {
            if texts.is_null(row) {
                None
            } else {
                Some(prompt.to_string())
            }
        })
        .collect()
}

fn extract_ids(col: &ArrayRef) -> Result<Int64Array, DriverError> {
    if let Some(ids) = col.as_any().downcast_ref::<Int64Array>() {
        return Ok(ids.clone());
    }
    if let Some(ids) = col.as_any().downcast_ref::<Int32Array>() {
        return Ok(ids.iter().map(|v| v.map(i64::from)).collect());
    }
    Err(DriverError::ColumnType {
        name: "id",
        actual: col.data_type().to_string(),
        expected: "int32 or int64",
    })
}

fn print_header(num_prompts: usize) {
    let mut header = String::from("id\ttext");
    for i in 0..num_prompts {
        header.push_str(&format!("\tout{i}"));
    }
    println!("{header}");
}

fn print_rows(ids: &Int64Array, texts: &StringArray, outputs: &[StringArray], num_prompts: usize) {
    for row in 0..texts.len() {
        println!("{}", format_row(ids, texts, outputs, num_prompts, row));
    }
}

fn format_row(
    ids: &Int64Array,
    texts: &StringArray,
    outputs: &[StringArray],
    num_prompts: usize,
    row: usize,
) -> String {
    if ids.is_null(row) || texts.is_null(row) {
        let mut line = String::from("NULL\tNULL");
        for _ in 0..num_prompts {
            line.push_str("\tNULL");
        }
        return line;
    }

    let mut line = format!("{}\t{}", ids.value(row), texts.value(row));
    for out in outputs {
        if out.is_null(row) || out.value(row).is_empty() {
            line.push_str("\tNULL");
        } else {
            line.push('\t');
            line.push_str(&one_line(out.value(row)));
        }
    }
    line
}

// answers must stay on one tab-separated line
fn one_line(s: &str) -> String {
    s.replace(['\n', '\r'], " ").trim().to_string()
}

fn print_summary(mode: Mode, wall: std::time::Duration) {
    let (req_count, req_total) = metrics::snapshot();

    println!();
    println!("mode\t{}", mode.as_str());
    println!("total_wall_time_sec\t{:.6}", wall.as_secs_f64());
    println!("requests\t{req_count}");

    if wall.as_secs_f64() > 0.0 {
        println!(
            "requests_per_sec\t{:.6}",
            req_count as f64 / wall.as_secs_f64()
        );
    } else {
        println!("requests_per_sec\t0");
    }

    if req_count > 0 {
        let avg_ms = req_total.as_secs_f64() * 1000.0 / req_count as f64;
        println!("avg_request_time_ms\t{avg_ms:.3}");
    } else {
        println!("avg_request_time_ms\t0");
    }
}
