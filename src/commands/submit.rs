use std::time::Duration;

use anyhow::{Context, Result};

use fleetdispatch::coordinator::{ClientConfig, MasterClient};
use fleetdispatch::models::DeviceType;
use fleetdispatch::scheduler::SubmitTask;
use fleetdispatch::utils::generate_device_id;

/// Parameters of the `submit` command
pub struct SubmitParams {
    pub master_url: String,
    pub task_type: String,
    pub payload: String,
    pub priority: Option<u8>,
    pub timeout_secs: Option<u64>,
    pub max_retry_count: Option<u32>,
    pub wait: bool,
    pub wait_timeout_secs: u64,
}

/// Submit one task to a master, optionally waiting for a terminal status
pub async fn submit(params: SubmitParams) -> Result<()> {
    let SubmitParams {
        master_url,
        task_type,
        payload,
        priority,
        timeout_secs,
        max_retry_count,
        wait,
        wait_timeout_secs,
    } = params;

    let payload: serde_json::Value =
        serde_json::from_str(&payload).context("Payload is not valid JSON")?;

    let mut request = SubmitTask::new(task_type, payload);
    if let Some(priority) = priority {
        request = request.with_priority(priority);
    }
    if let Some(secs) = timeout_secs {
        request = request.with_timeout_secs(secs);
    }
    if let Some(count) = max_retry_count {
        request = request.with_max_retry_count(count);
    }

    let client = MasterClient::new(ClientConfig::new(&master_url))
        .context("Failed to create master client")?;
    let task = client
        .submit_task(&request)
        .await
        .context("Task submission failed")?;

    println!("Submitted task {} ({}, priority {})", task.id, task.task_type, task.priority);
    if !wait {
        return Ok(());
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(wait_timeout_secs);
    loop {
        let current = client.get_task(task.id).await.context("Failed to fetch task")?;
        if current.state.is_terminal() {
            println!("Task {} finished: {}", current.id, current.status());
            println!("{}", serde_json::to_string_pretty(&current)?);
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!(
                "Task {} still {} after {}s",
                current.id,
                current.status(),
                wait_timeout_secs
            );
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

/// Print a generated device id
pub fn device_id(device_type: DeviceType, datacenter: Option<&str>, suffix: Option<&str>) {
    println!("{}", generate_device_id(device_type, datacenter, suffix));
}
