//! Job commands.

use anyhow::{Context, Result};
use jobq_core::{Job, JobId, JobState, NewJob};
use jobq_scheduler::Scheduler;
use std::collections::HashSet;

use super::parse_arg;

pub async fn submit(
    scheduler: &Scheduler,
    command: &str,
    args: &[String],
    after: &[i64],
    dedup: bool,
) -> Result<()> {
    let args: Vec<_> = args.iter().map(|a| parse_arg(a)).collect();
    let after: Vec<JobId> = after.iter().copied().map(JobId::new).collect();

    let job = if dedup {
        let job = scheduler.get_or_create_if_not_exists(command, args).await?;
        for dep in &after {
            scheduler
                .add_dependency(job.id, *dep)
                .await
                .with_context(|| format!("Failed to add dependency on job {}", dep))?;
        }
        job
    } else {
        let job = after
            .iter()
            .fold(NewJob::new(command, args), |job, dep| job.depends_on(*dep));
        scheduler.enqueue(job).await?
    };

    println!("{}", job.id);
    Ok(())
}

pub async fn show(scheduler: &Scheduler, id: i64) -> Result<()> {
    let job = scheduler.job(JobId::new(id)).await?;
    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}

pub async fn list(scheduler: &Scheduler, state: Option<&str>, limit: usize) -> Result<()> {
    let state = state.map(str::parse::<JobState>).transpose()?;
    let jobs = scheduler.store().list(state, limit).await?;

    if jobs.is_empty() {
        println!("No jobs");
        return Ok(());
    }
    for job in &jobs {
        print_row(job);
    }
    Ok(())
}

pub async fn next(scheduler: &Scheduler) -> Result<()> {
    let mut excluded = HashSet::new();
    match scheduler.find_startable_job(&mut excluded).await? {
        Some(job) => print_row(&job),
        None => println!("No startable job ({} pending jobs blocked)", excluded.len()),
    }
    Ok(())
}

pub async fn close(scheduler: &Scheduler, id: i64, state: &str) -> Result<()> {
    let proposed: JobState = state.parse()?;
    let state = scheduler.close_job(JobId::new(id), proposed).await?;
    if state == proposed {
        println!("Job {} closed as {}", id, state);
    } else {
        println!("Job {} closed as {} (requested {})", id, state, proposed);
    }
    Ok(())
}

pub async fn stats(scheduler: &Scheduler) -> Result<()> {
    for (state, count) in scheduler.store().count_by_state().await? {
        println!("{:<12}{}", state.as_str(), count);
    }
    Ok(())
}

fn print_row(job: &Job) {
    let args = serde_json::Value::from(job.args.clone());
    let deps: Vec<String> = job.dependencies.iter().map(JobId::to_string).collect();
    println!(
        "{:>8}  {:<10}  {} {}{}",
        job.id,
        job.state.as_str(),
        job.command,
        args,
        if deps.is_empty() {
            String::new()
        } else {
            format!("  after {}", deps.join(","))
        }
    );
}
