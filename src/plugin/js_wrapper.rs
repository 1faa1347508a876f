use std::future::poll_fn;
use std::sync::Arc;
use std::task::Poll;
use std::thread;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use super::channels::MessageChannels;
use super::context::CallTarget;
use super::js_runtime::{InjectedScript, RunnerRuntime};
use super::marshal::CallOutcome;
use super::pending::PendingCalls;
use crate::core::error::{BridgeError, Result};

/// Command sent to the engine worker thread
enum EngineCommand {
    Invoke {
        call_id: u32,
        target: CallTarget,
        args: String,
    },
    InvokeBlocking {
        target: CallTarget,
        args: String,
        resp: std::sync::mpsc::Sender<Result<CallOutcome>>,
    },
    HasMethod {
        name: String,
        resp: oneshot::Sender<Result<bool>>,
    },
    Describe {
        resp: oneshot::Sender<Result<String>>,
    },
    Inject {
        scripts: Vec<InjectedScript>,
        resp: oneshot::Sender<Result<()>>,
    },
    Shutdown {
        resp: oneshot::Sender<Result<()>>,
    },
}

/// What the command loop waits on next
enum Step {
    Command(EngineCommand),
    Closed,
    EngineFailed(anyhow::Error),
}

/// Owns one runner engine on a dedicated thread
///
/// The Deno runtime is single-threaded, so every interaction is a command
/// sent to the worker, which drives the engine's event loop between
/// commands. Calls are serialized onto that one queue.
pub struct EngineWorker {
    runner: String,
    tx: mpsc::UnboundedSender<EngineCommand>,
    calls: Arc<PendingCalls>,
}

impl EngineWorker {
    /// Spawn the worker, build the engine and evaluate `boot` in order
    pub async fn spawn(
        runner: &str,
        channels: MessageChannels,
        page: bool,
        boot: Vec<InjectedScript>,
    ) -> Result<Self> {
        let calls = Arc::new(PendingCalls::new(runner));
        let (tx, rx) = mpsc::unbounded_channel::<EngineCommand>();
        let (init_tx, init_rx) = oneshot::channel::<Result<()>>();

        let runner_id = runner.to_string();
        let worker_calls = Arc::clone(&calls);
        let channels = Arc::new(channels);

        thread::Builder::new()
            .name(format!("runner-{}", runner))
            .spawn(move || {
                info!(runner = %runner_id, "Starting engine worker thread");
                let _cancel = CancelOnExit {
                    calls: Arc::clone(&worker_calls),
                };

                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = init_tx.send(Err(BridgeError::Engine(format!(
                            "Failed to create worker runtime: {}",
                            e
                        ))));
                        return;
                    }
                };

                let local = tokio::task::LocalSet::new();
                local.block_on(&rt, async move {
                    let booted = RunnerRuntime::new(&runner_id, Arc::clone(&worker_calls), channels, page)
                        .and_then(|mut runtime| {
                            for script in &boot {
                                runtime.execute(script)?;
                            }
                            Ok(runtime)
                        });

                    let runtime = match booted {
                        Ok(runtime) => {
                            let _ = init_tx.send(Ok(()));
                            runtime
                        }
                        Err(e) => {
                            let _ = init_tx.send(Err(e));
                            return;
                        }
                    };

                    run_commands(&runner_id, runtime, rx, &worker_calls).await;
                    info!(runner = %runner_id, "Engine worker thread exiting");
                });
            })
            .map_err(|e| BridgeError::Engine(format!("Failed to spawn thread: {}", e)))?;

        match init_rx.await {
            Ok(Ok(())) => Ok(Self {
                runner: runner.to_string(),
                tx,
                calls,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(BridgeError::Engine("Channel closed".to_string())),
        }
    }

    pub fn runner(&self) -> &str {
        &self.runner
    }

    pub fn pending_calls(&self) -> usize {
        self.calls.len()
    }

    fn send(&self, command: EngineCommand) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| BridgeError::TornDown(format!("{} engine is gone", self.runner)))
    }

    async fn request<T>(&self, command: EngineCommand, resp_rx: oneshot::Receiver<Result<T>>) -> Result<T> {
        self.send(command)?;
        match resp_rx.await {
            Ok(res) => res,
            Err(_) => Err(BridgeError::TornDown(format!("{}: Channel closed", self.runner))),
        }
    }

    /// Start a call and wait for its completion slot
    pub async fn invoke(&self, target: CallTarget, args: String) -> Result<CallOutcome> {
        let pending = self.calls.register(target.name(), &args);
        self.send(EngineCommand::Invoke {
            call_id: pending.id(),
            target,
            args,
        })?;
        pending.wait().await
    }

    /// Run a call to completion, blocking the current thread
    pub fn invoke_blocking(&self, target: CallTarget, args: String) -> Result<CallOutcome> {
        let (resp_tx, resp_rx) = std::sync::mpsc::channel();
        self.send(EngineCommand::InvokeBlocking {
            target,
            args,
            resp: resp_tx,
        })?;
        resp_rx
            .recv()
            .map_err(|_| BridgeError::TornDown(format!("{}: Channel closed", self.runner)))?
    }

    pub async fn has_method(&self, name: &str) -> Result<bool> {
        let (resp_tx, resp_rx) = oneshot::channel();
        let command = EngineCommand::HasMethod {
            name: name.to_string(),
            resp: resp_tx,
        };
        self.request(command, resp_rx).await
    }

    pub async fn describe(&self) -> Result<String> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.request(EngineCommand::Describe { resp: resp_tx }, resp_rx).await
    }

    pub async fn inject(&self, scripts: Vec<InjectedScript>) -> Result<()> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.request(EngineCommand::Inject { scripts, resp: resp_tx }, resp_rx).await
    }

    /// Stop the worker; outstanding calls resolve with a teardown error
    pub async fn shutdown(&self) -> Result<()> {
        let (resp_tx, resp_rx) = oneshot::channel();
        match self.request(EngineCommand::Shutdown { resp: resp_tx }, resp_rx).await {
            Err(BridgeError::TornDown(_)) => Ok(()),
            other => other,
        }
    }
}

/// Fails whatever is still pending when the worker thread exits, unwinding included
struct CancelOnExit {
    calls: Arc<PendingCalls>,
}

impl Drop for CancelOnExit {
    fn drop(&mut self) {
        if thread::panicking() {
            error!(runner = %self.calls.runner(), "Engine worker panicked");
            self.calls.cancel_all("engine worker panicked");
        } else {
            self.calls.cancel_all("engine worker stopped");
        }
    }
}

impl Drop for EngineWorker {
    fn drop(&mut self) {
        self.calls.cancel_all("runner context dropped");
    }
}

async fn run_commands(
    runner: &str,
    mut runtime: RunnerRuntime,
    mut rx: mpsc::UnboundedReceiver<EngineCommand>,
    calls: &PendingCalls,
) {
    loop {
        let step = poll_fn(|cx| {
            if let Poll::Ready(command) = rx.poll_recv(cx) {
                return Poll::Ready(match command {
                    Some(command) => Step::Command(command),
                    None => Step::Closed,
                });
            }
            match runtime.poll_event_loop(cx) {
                Poll::Ready(Err(e)) => Poll::Ready(Step::EngineFailed(e)),
                _ => Poll::Pending,
            }
        })
        .await;

        let command = match step {
            Step::Command(command) => command,
            Step::Closed => break,
            Step::EngineFailed(e) => {
                error!(runner = %runner, "Engine event loop failed: {}", e);
                break;
            }
        };

        match command {
            EngineCommand::Invoke { call_id, target, args } => {
                if let Err(e) = runtime.begin_call(call_id, &target, &args) {
                    calls.resolve(call_id, Err(e));
                }
            }
            EngineCommand::InvokeBlocking { target, args, resp } => {
                let _ = resp.send(runtime.call_now(&target, &args));
            }
            EngineCommand::HasMethod { name, resp } => {
                let _ = resp.send(runtime.has_method(&name));
            }
            EngineCommand::Describe { resp } => {
                let _ = resp.send(runtime.describe());
            }
            EngineCommand::Inject { scripts, resp } => {
                let result = scripts.iter().try_for_each(|script| runtime.execute(script));
                let _ = resp.send(result);
            }
            EngineCommand::Shutdown { resp } => {
                debug!(runner = %runner, "Engine worker shutting down");
                calls.cancel_all("runner shut down");
                let _ = resp.send(Ok(()));
                break;
            }
        }
    }
}
