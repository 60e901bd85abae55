// Copyright (c) The cmdt Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Producer and consumer running against a shared work directory.

mod fixtures;

use crate::fixtures::*;
use camino_tempfile::tempdir;
use cmdt_runner::channel::{ChannelStore, Sentinel, SuiteChannel};
use color_eyre::eyre::Result;
use pretty_assertions::assert_eq;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn consumer_sees_in_order_completion() -> Result<()> {
    tail_while_producing(&[1, 2, 3, 4]).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn consumer_sees_reverse_completion_in_order() -> Result<()> {
    tail_while_producing(&[4, 3, 2, 1]).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn consumer_sees_interleaved_completion_in_order() -> Result<()> {
    tail_while_producing(&[2, 4, 1, 3]).await
}

async fn tail_while_producing(finish_order: &[u32]) -> Result<()> {
    let dir = tempdir()?;
    let config = config(dir.path());
    let producer = file_mux(&config);
    let consumer = file_mux(&config);

    let tail = tokio::spawn(async move {
        let (mut out, mut err) = (Vec::new(), Vec::new());
        consumer
            .tailer()
            .block_tail("smoke", Duration::from_secs(30), &mut out, &mut err)
            .await?;
        Ok::<_, color_eyre::Report>((out, err))
    });

    run_suite(&producer, "smoke", finish_order).await?;
    producer.flush_all_and_wait().await?;
    let (out, err) = tail.await??;

    let count = finish_order.len() as u32;
    assert_eq!(String::from_utf8(out)?, expected_stdout("smoke", count));
    assert_eq!(String::from_utf8(err)?, expected_stderr("smoke", count));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn interleaved_suites_stay_contiguous() -> Result<()> {
    let dir = tempdir()?;
    let config = config(dir.path());
    let producer = file_mux(&config);

    let (a, b) = tokio::join!(
        run_suite(&producer, "suite-a", &[3, 1, 2]),
        run_suite(&producer, "suite/b", &[2, 1]),
    );
    a?;
    b?;
    let handles = producer.flush_all();
    assert_eq!(handles.len(), 2);
    handles.wait().await?;

    // A fresh consumer discovers both suites from the work directory alone.
    let consumer = file_mux(&config);
    let (mut out, mut err) = (Vec::new(), Vec::new());
    consumer.tail_all(&mut out, &mut err).await?;

    // Stored suites are tailed in name order.
    assert_eq!(
        String::from_utf8(out)?,
        expected_stdout("suite-a", 3) + &expected_stdout("suite/b", 2),
    );
    assert_eq!(
        String::from_utf8(err)?,
        expected_stderr("suite-a", 3) + &expected_stderr("suite/b", 2),
    );
    Ok(())
}

#[tokio::test]
async fn reused_suite_with_shorter_run_starts_clean() -> Result<()> {
    tail_reused_suite(&[1, 2, 3], &[1]).await
}

#[tokio::test]
async fn reused_suite_with_longer_run_starts_clean() -> Result<()> {
    // Every stream of the second run is longer than the first, so only the generation stamp
    // tells the consumer that the suite was reset.
    tail_reused_suite(&[1], &[1, 2, 3]).await
}

async fn tail_reused_suite(first_run: &[u32], second_run: &[u32]) -> Result<()> {
    let dir = tempdir()?;
    let config = config(dir.path());
    let producer = file_mux(&config);
    // Long-lived, with offsets from the first run.
    let consumer = file_mux(&config);

    for finish_order in [first_run, second_run] {
        run_suite(&producer, "reuse", finish_order).await?;
        producer.flush_all_and_wait().await?;
        let (mut out, mut err) = (Vec::new(), Vec::new());
        consumer
            .tailer()
            .block_tail("reuse", Duration::from_secs(30), &mut out, &mut err)
            .await?;

        let count = finish_order.len() as u32;
        assert_eq!(String::from_utf8(out)?, expected_stdout("reuse", count));
        assert_eq!(String::from_utf8(err)?, expected_stderr("reuse", count));
    }
    Ok(())
}

#[tokio::test]
async fn clear_removes_files() -> Result<()> {
    let dir = tempdir()?;
    let config = config(dir.path());
    let producer = file_mux(&config);

    run_suite(&producer, "gone", &[1]).await?;
    producer.flush_all_and_wait().await?;
    let store = producer.registry().store().clone();
    assert_eq!(store.list_suites()?, vec!["gone"]);
    assert!(store.channel("gone").is_marked(Sentinel::Flushed)?);

    producer.clear_suite("gone")?;
    assert!(store.list_suites()?.is_empty());
    Ok(())
}
