//! Redfire ACS management CLI

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use colored::*;
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "redfire-acs-cli")]
#[command(about = "Redfire ACS Management CLI")]
#[command(version = redfire_acs::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// ACS host to connect to
    #[arg(long, default_value = "localhost")]
    host: String,

    /// ACS management port
    #[arg(short, long, default_value = "8080")]
    port: u16,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered devices
    Devices,
    /// Show device details
    Show {
        device_id: String,
    },
    /// List the known parameter snapshot of a device
    Parameters {
        device_id: String,
        /// Only show parameters whose name starts with this prefix
        #[arg(long)]
        prefix: Option<String>,
    },
    /// Show task history for a device, newest first
    Tasks {
        device_id: String,
    },
    /// Queue a GetParameterValues task
    Get {
        device_id: String,
        /// Parameter names to read
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Queue a SetParameterValues task
    Set {
        device_id: String,
        /// name=value assignments to write
        #[arg(required = true)]
        assignments: Vec<String>,
    },
    /// Queue a reboot
    Reboot {
        device_id: String,
    },
    /// Queue a factory reset
    FactoryReset {
        device_id: String,
    },
    /// Show inventory statistics
    Stats,
}

struct ApiClient {
    base_url: String,
    http: reqwest::Client,
}

impl ApiClient {
    fn new(host: &str, port: u16) -> Self {
        Self {
            base_url: format!("http://{}:{}", host, port),
            http: reqwest::Client::new(),
        }
    }

    async fn get(&self, path: &str) -> anyhow::Result<Value> {
        let response = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .context("could not reach the ACS")?;
        Self::decode(response).await
    }

    async fn post(&self, path: &str, body: Value) -> anyhow::Result<Value> {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(&body)
            .send()
            .await
            .context("could not reach the ACS")?;
        Self::decode(response).await
    }

    async fn decode(response: reqwest::Response) -> anyhow::Result<Value> {
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            let detail = body["error"].as_str().unwrap_or("unknown error").to_string();
            bail!("ACS returned {}: {}", status, detail);
        }
        Ok(body)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let client = ApiClient::new(&cli.host, cli.port);

    match cli.command {
        Commands::Devices => list_devices(&client).await,
        Commands::Show { device_id } => show_device(&client, &device_id).await,
        Commands::Parameters { device_id, prefix } => {
            list_parameters(&client, &device_id, prefix.as_deref()).await
        }
        Commands::Tasks { device_id } => list_tasks(&client, &device_id).await,
        Commands::Get { device_id, names } => queue_get(&client, &device_id, names).await,
        Commands::Set {
            device_id,
            assignments,
        } => queue_set(&client, &device_id, assignments).await,
        Commands::Reboot { device_id } => {
            queue_simple(&client, &device_id, "reboot").await
        }
        Commands::FactoryReset { device_id } => {
            queue_simple(&client, &device_id, "factory-reset").await
        }
        Commands::Stats => show_stats(&client).await,
    }
}

fn status_label(online: bool) -> ColoredString {
    if online {
        "ONLINE".green()
    } else {
        "OFFLINE".red()
    }
}

fn text(value: &Value) -> String {
    value.as_str().unwrap_or("-").to_string()
}

async fn list_devices(client: &ApiClient) -> anyhow::Result<()> {
    let devices = client.get("/api/devices").await?;
    let devices = devices.as_array().cloned().unwrap_or_default();

    println!("{}", "Registered Devices".bold().blue());
    println!();
    if devices.is_empty() {
        println!("No devices found.");
        return Ok(());
    }

    println!(
        "{:<36} {:<15} {:<15} {:<8} {:<25} {}",
        "Device ID".bold(),
        "Manufacturer".bold(),
        "Model".bold(),
        "Status".bold(),
        "Last Inform".bold(),
        "SW Version".bold()
    );
    println!("{}", "─".repeat(110));
    for device in &devices {
        println!(
            "{:<36} {:<15} {:<15} {:<8} {:<25} {}",
            text(&device["id"]),
            text(&device["manufacturer"]),
            text(&device["product_class"]),
            status_label(device["online"].as_bool().unwrap_or(false)),
            text(&device["last_inform"]),
            text(&device["software_version"]),
        );
    }
    println!();
    println!("Total devices: {}", devices.len());
    Ok(())
}

async fn show_device(client: &ApiClient, device_id: &str) -> anyhow::Result<()> {
    let device = client.get(&format!("/api/devices/{}", device_id)).await?;

    println!("{}", format!("Device {}", device_id).bold().blue());
    println!();
    println!("{:<22} {}", "Manufacturer:".bold(), text(&device["manufacturer"]));
    println!("{:<22} {}", "OUI:".bold(), text(&device["oui"]));
    println!("{:<22} {}", "Product Class:".bold(), text(&device["product_class"]));
    println!("{:<22} {}", "Serial Number:".bold(), text(&device["serial_number"]));
    println!("{:<22} {}", "IP Address:".bold(), text(&device["ip_address"]));
    println!(
        "{:<22} {}",
        "Status:".bold(),
        status_label(device["online"].as_bool().unwrap_or(false))
    );
    println!("{:<22} {}", "Software Version:".bold(), text(&device["software_version"]));
    println!("{:<22} {}", "Hardware Version:".bold(), text(&device["hardware_version"]));
    println!("{:<22} {}", "First Seen:".bold(), text(&device["first_seen"]));
    println!("{:<22} {}", "Last Inform:".bold(), text(&device["last_inform"]));
    println!(
        "{:<22} {}",
        "CR URL:".bold(),
        text(&device["connection_request_url"])
    );
    Ok(())
}

async fn list_parameters(
    client: &ApiClient,
    device_id: &str,
    prefix: Option<&str>,
) -> anyhow::Result<()> {
    let parameters = client
        .get(&format!("/api/devices/{}/parameters", device_id))
        .await?;
    let parameters = parameters.as_array().cloned().unwrap_or_default();

    let shown: Vec<&Value> = parameters
        .iter()
        .filter(|p| match prefix {
            Some(prefix) => p["name"].as_str().is_some_and(|n| n.starts_with(prefix)),
            None => true,
        })
        .collect();

    println!("{}", format!("Parameters of {}", device_id).bold().blue());
    println!();
    if shown.is_empty() {
        println!("No parameters found.");
        return Ok(());
    }

    for parameter in &shown {
        println!(
            "{} = {}",
            text(&parameter["name"]).bold(),
            text(&parameter["value"])
        );
    }
    println!();
    println!("{} parameter(s)", shown.len());
    Ok(())
}

async fn list_tasks(client: &ApiClient, device_id: &str) -> anyhow::Result<()> {
    let tasks = client
        .get(&format!("/api/devices/{}/tasks", device_id))
        .await?;
    let tasks = tasks.as_array().cloned().unwrap_or_default();

    println!("{}", format!("Tasks of {}", device_id).bold().blue());
    println!();
    if tasks.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }

    println!(
        "{:<6} {:<15} {:<10} {:<25} {}",
        "ID".bold(),
        "Type".bold(),
        "Status".bold(),
        "Created".bold(),
        "Completed".bold()
    );
    println!("{}", "─".repeat(85));
    for task in &tasks {
        let status = text(&task["status"]);
        let colored_status = match status.as_str() {
            "completed" => status.green(),
            "failed" => status.red(),
            "sent" => status.yellow(),
            _ => status.normal(),
        };
        println!(
            "{:<6} {:<15} {:<10} {:<25} {}",
            task["id"].to_string(),
            text(&task["type"]),
            colored_status,
            text(&task["created_at"]),
            text(&task["completed_at"]),
        );
    }
    Ok(())
}

async fn queue_get(client: &ApiClient, device_id: &str, names: Vec<String>) -> anyhow::Result<()> {
    let task = client
        .post(
            &format!("/api/devices/{}/tasks", device_id),
            json!({ "type": "get_params", "parameters": { "names": names } }),
        )
        .await?;
    println!(
        "{} task {} queued",
        "✓".green(),
        task["id"]
    );
    Ok(())
}

async fn queue_set(
    client: &ApiClient,
    device_id: &str,
    assignments: Vec<String>,
) -> anyhow::Result<()> {
    let mut values = serde_json::Map::new();
    for assignment in &assignments {
        let Some((name, value)) = assignment.split_once('=') else {
            bail!("invalid assignment '{}', expected name=value", assignment);
        };
        values.insert(name.to_string(), Value::String(value.to_string()));
    }

    let task = client
        .post(
            &format!("/api/devices/{}/tasks", device_id),
            json!({ "type": "set_params", "parameters": { "values": values } }),
        )
        .await?;
    println!("{} task {} queued", "✓".green(), task["id"]);
    Ok(())
}

async fn queue_simple(client: &ApiClient, device_id: &str, action: &str) -> anyhow::Result<()> {
    let task = client
        .post(&format!("/api/devices/{}/{}", device_id, action), json!({}))
        .await?;
    println!("{} task {} queued", "✓".green(), task["id"]);
    Ok(())
}

async fn show_stats(client: &ApiClient) -> anyhow::Result<()> {
    let stats = client.get("/api/stats").await?;

    println!("{}", "ACS Statistics".bold().blue());
    println!();
    println!("{:<16} {}", "Total Devices:".bold(), stats["total_devices"]);
    println!(
        "{:<16} {}",
        "Online:".bold(),
        stats["online"].to_string().green()
    );
    println!(
        "{:<16} {}",
        "Offline:".bold(),
        stats["offline"].to_string().red()
    );
    println!("{:<16} {}", "Pending Tasks:".bold(), stats["pending_tasks"]);
    Ok(())
}
