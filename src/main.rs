mod credential;
mod dashboard;
mod logger;
mod runtime;
mod session;

use credential::CredentialHolder;
use dashboard::{Message, View};
use runtime::Runtime;

use data::{Config, config::CONFIG_FILE};
use feed::Credential;
use tokio::io::AsyncBufReadExt;
use tokio::sync::{mpsc, watch};

fn main() {
    logger::setup(cfg!(debug_assertions)).expect("Failed to initialize logger");

    std::panic::set_hook(Box::new(|info| {
        let location = info.location().map_or_else(
            || "unknown location".to_string(),
            |loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()),
        );
        let msg = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        log::error!("PANIC at {location}: {msg}");
        eprintln!("PANIC at {location}: {msg}");
    }));

    if let Err(e) = launch() {
        log::error!("{e}");
        std::process::exit(1);
    }
}

fn launch() -> Result<(), Box<dyn std::error::Error>> {
    let first_run = !data::data_path(Some(CONFIG_FILE)).exists();
    let config = Config::load()?;
    if first_run && let Err(e) = config.save() {
        log::warn!("Could not write default {CONFIG_FILE}: {e}");
    }

    let stream_url = config.stream_url()?;
    log::info!("backend {} / stream {}", config.api_url, stream_url);

    let holder = CredentialHolder::new(
        std::env::var("INSIGHT_TOKEN")
            .ok()
            .filter(|token| !token.trim().is_empty())
            .map(Credential::new),
    );

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    rt.block_on(async move {
        let (runtime, view) = Runtime::new(&config, stream_url, holder.subscribe());

        let commands = tokio::spawn(read_commands(holder, runtime.sender()));
        let readout = tokio::spawn(log_readout(view));

        runtime
            .run(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    log::error!("Failed to listen for Ctrl-C: {e}");
                }
            })
            .await;

        commands.abort();
        readout.abort();
    });

    Ok(())
}

/// One command per stdin line: a token logs in, `logout` or a blank line logs out.
async fn read_commands(holder: CredentialHolder, dashboard: mpsc::UnboundedSender<Message>) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                log::error!("Failed to read stdin: {e}");
                break;
            }
        };

        match line.trim() {
            "" | "logout" => holder.logout(),
            "forecast on" => {
                let _ = dashboard.send(Message::ToggleForecast(true));
            }
            "forecast off" => {
                let _ = dashboard.send(Message::ToggleForecast(false));
            }
            token => holder.login(Credential::new(token)),
        }
    }
}

async fn log_readout(mut view: watch::Receiver<View>) {
    while view.changed().await.is_ok() {
        let line = readout(&view.borrow_and_update());
        log::info!("{line}");
    }
}

fn readout(view: &View) -> String {
    let latest = view.latest.as_ref().map_or_else(
        || "--".to_string(),
        |p| format!("{} {:.2} @ {}", p.name, p.value, p.timestamp),
    );

    let forecast = match (&view.forecast, view.show_forecast) {
        (_, false) => "forecast hidden".to_string(),
        (Some(snapshot), true) => match snapshot.horizon() {
            Some(horizon) => format!(
                "forecast to {horizon}, {} anomalies",
                view.timeline.anomaly_count()
            ),
            None => "forecast empty".to_string(),
        },
        (None, true) => "no forecast".to_string(),
    };

    let mut line = format!(
        "[{}] {latest} | {} pts | {forecast}",
        view.state,
        view.history.len()
    );
    if view.malformed_frames > 0 {
        line.push_str(&format!(" | {} malformed", view.malformed_frames));
    }
    for err in [&view.error, &view.history_error, &view.forecast_error]
        .into_iter()
        .flatten()
    {
        line.push_str(&format!(" | {err}"));
    }
    line
}
