use super::{report, spin_fail, spin_ok, spinner, CommandError};
use indicatif::ProgressBar;
use pgvenv_core::{Engine, PipelineEvent};

pub fn run(
    engine: &Engine,
    name: &str,
    source_ref: Option<&str>,
    json: bool,
) -> Result<u8, CommandError> {
    let mut current: Option<ProgressBar> = None;
    engine.create_virtualenv(name, source_ref, &mut |event| match event {
        PipelineEvent::Started(step) => {
            let msg = format!("{step}...");
            if step.streams_output() {
                eprintln!("{msg}");
            } else {
                current = Some(spinner(&msg));
            }
        }
        PipelineEvent::Finished(step) => {
            if let Some(pb) = current.take() {
                spin_ok(&pb, &step.to_string());
            }
        }
        PipelineEvent::Failed(step) => {
            if let Some(pb) = current.take() {
                spin_fail(&pb, &step.to_string());
            }
        }
        PipelineEvent::Skipped(step) => {
            tracing::info!("{step}: already done");
        }
    })?;

    report(
        engine,
        name,
        json,
        &format!("pg_venv {name} created. Run `pg workon {name}` to use it."),
    )
}
