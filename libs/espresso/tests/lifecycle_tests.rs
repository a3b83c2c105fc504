use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use espresso::{
    App, AppState, CallContext, DispatchError, Module, ModuleCtx, ShutdownOptions,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

type Log = Arc<Mutex<Vec<String>>>;

struct Probe {
    uid: &'static str,
    log: Log,
}

#[async_trait]
impl Module for Probe {
    fn uid(&self) -> String {
        self.uid.to_string()
    }

    async fn init(&self, _ctx: &ModuleCtx) -> anyhow::Result<()> {
        self.log.lock().push(format!("init:{}", self.uid));
        Ok(())
    }

    async fn exit(&self, _ctx: &ModuleCtx) -> anyhow::Result<()> {
        self.log.lock().push(format!("exit:{}", self.uid));
        Ok(())
    }

    async fn clean(&self, _ctx: &ModuleCtx) -> anyhow::Result<()> {
        self.log.lock().push(format!("clean:{}", self.uid));
        Ok(())
    }
}

/// Subscribes to "evt" in init, counts deliveries, and publishes from exit.
struct Listener {
    hits: Arc<AtomicUsize>,
    jobs: Arc<AtomicUsize>,
}

#[async_trait]
impl Module for Listener {
    fn uid(&self) -> String {
        "listener".into()
    }

    async fn init(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        let hits = self.hits.clone();
        ctx.bus().subscribe_typed("evt", move |_: &()| {
            hits.fetch_add(1, Ordering::SeqCst);
        });

        let jobs = self.jobs.clone();
        ctx.scheduler().schedule("* * * * * *", move || {
            let jobs = jobs.clone();
            async move {
                jobs.fetch_add(1, Ordering::SeqCst);
            }
        })?;

        ctx.dispatcher().register_typed("listener", "echo", echo);
        Ok(())
    }

    async fn exit(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        assert!(!ctx.scheduler().is_running());
        ctx.bus().publish("evt", ());
        Ok(())
    }
}

async fn echo(ctx: CallContext, req: Value) -> Result<Value, DispatchError> {
    Ok(json!({ "module": ctx.module, "message": ctx.message, "req": req }))
}

async fn wait_for_state(app: &App, state: AppState) {
    for _ in 0..200 {
        if app.state() == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("app never reached {state:?}");
}

#[tokio::test]
async fn modules_init_forward_and_tear_down_reverse() {
    let log = Log::default();
    let app = Arc::new(
        App::builder()
            .module(Arc::new(Probe { uid: "a", log: log.clone() }))
            .module(Arc::new(Probe { uid: "b", log: log.clone() }))
            .build(),
    );

    let cancel = CancellationToken::new();
    let runner = {
        let app = app.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { app.run(ShutdownOptions::Token(cancel)).await })
    };

    wait_for_state(&app, AppState::Running).await;
    for _ in 0..200 {
        if log.lock().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(*log.lock(), vec!["init:a", "init:b"]);

    cancel.cancel();
    runner.await.unwrap().unwrap();
    assert_eq!(app.state(), AppState::Stopped);
    assert_eq!(
        *log.lock(),
        vec!["init:a", "init:b", "exit:b", "exit:a", "clean:b", "clean:a"]
    );
}

#[tokio::test]
async fn events_are_gated_before_exit() {
    let hits = Arc::new(AtomicUsize::new(0));
    let jobs = Arc::new(AtomicUsize::new(0));
    let app = Arc::new(
        App::builder()
            .module(Arc::new(Listener {
                hits: hits.clone(),
                jobs: jobs.clone(),
            }))
            .build(),
    );

    let cancel = CancellationToken::new();
    let runner = {
        let app = app.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { app.run(ShutdownOptions::Token(cancel)).await })
    };

    for _ in 0..200 {
        if app.dispatcher().contains("listener", "echo") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    app.bus().publish("evt", ());
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(1_200)).await;
    cancel.cancel();
    runner.await.unwrap().unwrap();

    // The publish from exit() and this one are both dropped.
    app.bus().publish("evt", ());
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(app.bus().dropped_events(), 2);

    assert!(jobs.load(Ordering::SeqCst) >= 1);
    let after = jobs.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    assert_eq!(jobs.load(Ordering::SeqCst), after);
}

#[tokio::test]
async fn unregistered_route_is_not_found() {
    let app = App::builder().build();
    let err = app
        .dispatcher()
        .dispatch("say", "hello", CallContext::new("say", "hello"), json!({"content": "hi"}))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::NotFound(_)));
}

#[tokio::test]
async fn http_calls_reach_initialized_modules() {
    let app = Arc::new(
        App::builder()
            .module(Arc::new(Listener {
                hits: Arc::default(),
                jobs: Arc::default(),
            }))
            .http("127.0.0.1:0")
            .shutdown_timeout(Duration::from_millis(500))
            .build(),
    );

    let cancel = CancellationToken::new();
    let runner = {
        let app = app.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { app.run(ShutdownOptions::Token(cancel)).await })
    };

    let mut addr = None;
    for _ in 0..200 {
        addr = app.http_local_addr();
        if addr.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let addr = addr.expect("listener bound");
    // Listener binds only after init_all, so the route must exist already.
    assert!(app.dispatcher().contains("listener", "echo"));

    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(
            b"GET /daydream/listener/echo?x=1 HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        )
        .await
        .unwrap();
    let mut raw = String::new();
    stream.read_to_string(&mut raw).await.unwrap();

    assert!(raw.starts_with("HTTP/1.1 200"), "{raw}");
    assert!(raw.to_ascii_lowercase().contains("x-request-id"));
    assert!(raw.contains(r#""x":"1""#), "{raw}");

    cancel.cancel();
    runner.await.unwrap().unwrap();
    assert_eq!(app.state(), AppState::Stopped);
}
