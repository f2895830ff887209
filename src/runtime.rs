use crate::credential::Versioned;
use crate::dashboard::{Action, Dashboard, Message, View};
use crate::session;

use data::Config;
use feed::{Event, StreamId, adapter};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use url::Url;

use std::future::Future;
use std::time::Duration;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
const EVENT_BUFFER: usize = 256;

struct StreamHandle {
    id: StreamId,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Executes dashboard actions on tokio: transports, timers and HTTP fetches.
///
/// Everything spawned here is owned by the runtime and aborted when it is dropped.
pub struct Runtime {
    dashboard: Dashboard,
    api_url: Url,
    client: reqwest::Client,
    credentials: watch::Receiver<Versioned>,
    events_tx: mpsc::Sender<Event>,
    events_rx: mpsc::Receiver<Event>,
    messages_tx: mpsc::UnboundedSender<Message>,
    messages_rx: mpsc::UnboundedReceiver<Message>,
    stream: Option<StreamHandle>,
    /// Transports told to shut down that the next one must wait out.
    retiring: Vec<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    forecast_timer: Option<JoinHandle<()>>,
    fetches: JoinSet<()>,
    view: watch::Sender<View>,
}

impl Runtime {
    pub fn new(
        config: &Config,
        stream_url: Url,
        credentials: watch::Receiver<Versioned>,
    ) -> (Self, watch::Receiver<View>) {
        let dashboard = Dashboard::new(config, stream_url, credentials.clone());
        let (view, view_rx) = watch::channel(dashboard.view());
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();

        let runtime = Self {
            dashboard,
            api_url: config.api_url.clone(),
            client: reqwest::Client::new(),
            credentials,
            events_tx,
            events_rx,
            messages_tx,
            messages_rx,
            stream: None,
            retiring: Vec::new(),
            reconnect: None,
            forecast_timer: None,
            fetches: JoinSet::new(),
            view,
        };
        (runtime, view_rx)
    }

    /// Handle for inputs that do not come from the credential holder, like the
    /// forecast toggle.
    pub fn sender(&self) -> mpsc::UnboundedSender<Message> {
        self.messages_tx.clone()
    }

    /// Drives the dashboard until `shutdown` resolves, then closes the stream with
    /// the intentional code and waits for it to go away.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        let mut shutdown = std::pin::pin!(shutdown);
        let mut holder_alive = true;

        self.credentials.borrow_and_update();
        self.dispatch(Message::CredentialChanged);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                changed = self.credentials.changed(), if holder_alive => {
                    match changed {
                        Ok(()) => self.dispatch(Message::CredentialChanged),
                        Err(_) => {
                            log::debug!("credential holder dropped");
                            holder_alive = false;
                        }
                    }
                }
                Some(event) = self.events_rx.recv() => self.dispatch(Message::Stream(event)),
                Some(message) = self.messages_rx.recv() => self.dispatch(message),
                Some(joined) = self.fetches.join_next(), if !self.fetches.is_empty() => {
                    if let Err(e) = joined {
                        log::error!("fetch task failed: {e}");
                    }
                }
            }
        }

        log::info!("shutting down");
        for action in self.dashboard.teardown() {
            self.execute(action);
        }
        self.publish();

        for task in std::mem::take(&mut self.retiring) {
            wait_closed(task).await;
        }
    }

    fn dispatch(&mut self, message: Message) {
        for action in self.dashboard.update(message) {
            self.execute(action);
        }
        self.publish();
    }

    fn publish(&self) {
        let next = self.dashboard.view();
        self.view.send_if_modified(|view| {
            if *view == next {
                return false;
            }
            *view = next;
            true
        });
    }

    fn execute(&mut self, action: Action) {
        match action {
            Action::Stream(session::Action::Open { id, url }) => self.open_stream(id, url),
            Action::Stream(session::Action::Close { id }) => match self.stream.take() {
                Some(handle) if handle.id == id => self.close_stream(handle),
                other => self.stream = other,
            },
            Action::Stream(session::Action::ScheduleReconnect { epoch, delay }) => {
                abort(self.reconnect.take());

                let messages = self.messages_tx.clone();
                self.reconnect = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = messages.send(Message::ReconnectDue(epoch));
                }));
            }
            Action::Stream(session::Action::CancelReconnect) => abort(self.reconnect.take()),
            Action::FetchHistory { req_id, credential } => {
                let (client, api, messages) = self.fetch_context();
                self.fetches.spawn(async move {
                    let result = adapter::fetch_history(&client, &api, &credential).await;
                    let _ = messages.send(Message::HistoryFetched(req_id, result));
                });
            }
            Action::FetchForecast { req_id, credential } => {
                let (client, api, messages) = self.fetch_context();
                self.fetches.spawn(async move {
                    let result = adapter::fetch_forecast(&client, &api, &credential).await;
                    let _ = messages.send(Message::ForecastFetched(req_id, result));
                });
            }
            Action::StartForecastTimer(period) => {
                abort(self.forecast_timer.take());
                log::info!("forecast refresh every {period:?}");

                let messages = self.messages_tx.clone();
                self.forecast_timer = Some(tokio::spawn(async move {
                    let mut interval = tokio::time::interval(period);
                    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                    loop {
                        interval.tick().await;
                        if messages.send(Message::ForecastTick).is_err() {
                            break;
                        }
                    }
                }));
            }
            Action::StopForecastTimer => {
                log::info!("forecast refresh stopped");
                abort(self.forecast_timer.take());
            }
        }
    }

    fn fetch_context(&self) -> (reqwest::Client, Url, mpsc::UnboundedSender<Message>) {
        (
            self.client.clone(),
            self.api_url.clone(),
            self.messages_tx.clone(),
        )
    }

    /// Spawns the transport for `id`. It connects only after every retiring
    /// transport has finished, so at most one socket is open at a time.
    fn open_stream(&mut self, id: StreamId, url: Url) {
        if let Some(previous) = self.stream.take() {
            self.close_stream(previous);
        }
        let previous = std::mem::take(&mut self.retiring);

        let (shutdown, shutdown_rx) = oneshot::channel();
        let events = self.events_tx.clone();
        let task = tokio::spawn(async move {
            for task in previous {
                wait_closed(task).await;
            }
            adapter::connect_data_stream(id, url, events, shutdown_rx).await;
        });

        self.stream = Some(StreamHandle { id, shutdown, task });
    }

    fn close_stream(&mut self, handle: StreamHandle) {
        let StreamHandle { id, shutdown, task } = handle;

        if task.is_finished() {
            return;
        }
        log::debug!("retiring stream {id}");
        let _ = shutdown.send(());
        self.retiring.push(task);
    }
}

/// Waits for a transport to send its close frame, aborting it after [`CLOSE_TIMEOUT`].
async fn wait_closed(mut task: JoinHandle<()>) {
    if tokio::time::timeout(CLOSE_TIMEOUT, &mut task).await.is_err() {
        log::warn!("stream did not close within {CLOSE_TIMEOUT:?}, aborting");
        task.abort();
        let _ = task.await;
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if let Some(handle) = self.stream.take() {
            handle.task.abort();
        }
        for task in self.retiring.drain(..) {
            task.abort();
        }
        abort(self.reconnect.take());
        abort(self.forecast_timer.take());
    }
}

fn abort(task: Option<JoinHandle<()>>) {
    if let Some(task) = task {
        task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::{CredentialHolder, Epoch};
    use feed::ConnectionState;

    fn runtime(holder: &CredentialHolder) -> (Runtime, watch::Receiver<View>) {
        let config = Config::default();
        let url = config.stream_url().unwrap();
        Runtime::new(&config, url, holder.subscribe())
    }

    fn open(id: u64, url: &Url) -> Action {
        Action::Stream(session::Action::Open {
            id: StreamId(id),
            url: url.clone(),
        })
    }

    fn close(id: u64) -> Action {
        Action::Stream(session::Action::Close { id: StreamId(id) })
    }

    #[tokio::test]
    async fn next_stream_connects_only_after_previous_is_gone() {
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("ws://{}/ws", listener.local_addr().unwrap())).unwrap();
        let holder = CredentialHolder::new(None);
        let (mut rt, _view) = runtime(&holder);

        // the listener never answers the handshake, so the first stream stays open
        rt.execute(open(1, &url));
        let (mut first, _) = listener.accept().await.unwrap();

        rt.execute(close(1));
        rt.execute(open(2, &url));
        let (_second, _) = listener.accept().await.unwrap();

        let mut request = Vec::new();
        let drained =
            tokio::time::timeout(Duration::from_millis(200), first.read_to_end(&mut request))
                .await;
        assert!(
            matches!(drained, Ok(Ok(_))),
            "first socket still open when the second connected"
        );
    }

    #[tokio::test]
    async fn finished_streams_are_not_retained() {
        let holder = CredentialHolder::new(None);
        let (mut rt, _view) = runtime(&holder);
        let refused = Url::parse("ws://127.0.0.1:9/ws").unwrap();

        for id in 1..=20 {
            rt.execute(open(id, &refused));
            for _ in 0..10 {
                tokio::task::yield_now().await;
            }
        }

        assert!(rt.retiring.is_empty());

        rt.execute(close(20));
        assert!(rt.retiring.len() <= 1);
        rt.execute(open(21, &refused));
        assert!(rt.retiring.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_fires_after_delay() {
        let holder = CredentialHolder::new(None);
        let (mut rt, _view) = runtime(&holder);
        let started = tokio::time::Instant::now();

        rt.execute(Action::Stream(session::Action::ScheduleReconnect {
            epoch: Epoch(4),
            delay: Duration::from_secs(3),
        }));

        match rt.messages_rx.recv().await {
            Some(Message::ReconnectDue(epoch)) => assert_eq!(epoch, Epoch(4)),
            other => panic!("unexpected message: {other:?}"),
        }
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_reconnect_never_fires() {
        let holder = CredentialHolder::new(None);
        let (mut rt, _view) = runtime(&holder);

        rt.execute(Action::Stream(session::Action::ScheduleReconnect {
            epoch: Epoch(1),
            delay: Duration::from_secs(3),
        }));
        rt.execute(Action::Stream(session::Action::CancelReconnect));

        let waited = tokio::time::timeout(Duration::from_secs(10), rt.messages_rx.recv()).await;
        assert!(waited.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn forecast_timer_ticks_immediately_then_periodically() {
        let holder = CredentialHolder::new(None);
        let (mut rt, _view) = runtime(&holder);
        let started = tokio::time::Instant::now();

        rt.execute(Action::StartForecastTimer(Duration::from_secs(30)));

        assert!(matches!(
            rt.messages_rx.recv().await,
            Some(Message::ForecastTick)
        ));
        assert!(started.elapsed() < Duration::from_secs(1));

        assert!(matches!(
            rt.messages_rx.recv().await,
            Some(Message::ForecastTick)
        ));
        assert!(started.elapsed() >= Duration::from_secs(30));

        rt.execute(Action::StopForecastTimer);
        let waited = tokio::time::timeout(Duration::from_secs(90), rt.messages_rx.recv()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn runs_until_shutdown_without_credential() {
        let holder = CredentialHolder::new(None);
        let (rt, view) = runtime(&holder);

        rt.run(async {}).await;

        assert_eq!(view.borrow().state, ConnectionState::Disconnected);
        assert!(view.borrow().history.is_empty());
    }
}
