//! A clean notify on a live stratum session flushes staged work.

mod common;

use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use quarry_core::{Engine, EngineConfig, PoolConfig};

use common::eventually;

fn notify(clean: bool) -> Value {
    json!({
        "id": null,
        "method": "mining.notify",
        "params": ["b1", "22".repeat(32), "01000000", "ffffffff", [], "20000000", "1d00ffff", "65a0b1c2", clean]
    })
}

async fn send(write: &mut tokio::net::tcp::OwnedWriteHalf, message: Value) -> std::io::Result<()> {
    let mut line = message.to_string();
    line.push('\n');
    write.write_all(line.as_bytes()).await
}

async fn serve_connection(stream: TcpStream, mut clean: watch::Receiver<u32>) -> std::io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { return Ok(()) };
                let request: Value = serde_json::from_str(&line)?;
                let id = request["id"].clone();
                match request["method"].as_str() {
                    Some("mining.subscribe") => {
                        send(&mut write, json!({
                            "id": id,
                            "result": [[["mining.notify", "ae6812eb"]], "aabbccdd", 4],
                            "error": null
                        })).await?;
                    }
                    Some("mining.authorize") => {
                        send(&mut write, json!({"id": id, "result": true, "error": null})).await?;
                        send(&mut write, json!({"id": null, "method": "mining.set_difficulty", "params": [1]})).await?;
                        send(&mut write, notify(false)).await?;
                    }
                    _ => {
                        send(&mut write, json!({"id": id, "result": true, "error": null})).await?;
                    }
                }
            }
            changed = clean.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                send(&mut write, notify(true)).await?;
            }
        }
    }
}

async fn fake_pool() -> (String, watch::Sender<u32>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (clean_tx, clean_rx) = watch::channel(0u32);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_connection(stream, clean_rx.clone()));
        }
    });
    (format!("stratum+tcp://{}", addr), clean_tx)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_clean_notify_discards_staged_jobs() {
    let (url, clean) = fake_pool().await;
    let config = EngineConfig {
        queue_depth: 5,
        ..EngineConfig::with_pools(vec![PoolConfig::new(&url).with_credentials("w", "x")])
    };
    let engine = Engine::new(config).unwrap();
    engine.start().await.unwrap();

    assert!(eventually(Duration::from_secs(10), || engine.queue_len() == 5).await);
    assert_eq!(engine.restart_epoch(), 0);
    assert_eq!(engine.stats_snapshot().global.discarded_work, 0);

    clean.send(1).unwrap();

    assert!(eventually(Duration::from_secs(10), || engine.restart_epoch() == 1).await);
    assert!(eventually(Duration::from_secs(10), || {
        engine.stats_snapshot().global.discarded_work >= 5
    })
    .await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(engine.restart_epoch(), 1);
    assert_eq!(engine.current_block().generation, 1);
    assert!(engine.queue_len() >= 1);

    let pools = engine.pool_snapshots();
    assert!(pools[0].session_active);
    assert!((pools[0].share_difficulty - 1.0).abs() < f64::EPSILON);

    engine.shutdown().await;
}
