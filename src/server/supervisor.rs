// Supervision of the dev server and its helper watchers.
//
// Every worker (the HTTP loop, the HAML watcher, the Compass child process)
// sends its output as `ConsoleLine`s over one channel; a single console
// thread prints them with a colored tag. Shutdown is driven by a shared
// `running` flag, cleared by Ctrl+C or by the HTTP loop ending.

use crossterm::style::Stylize;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Which worker a line of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Server,
    Haml,
    Compass,
}

impl Source {
    fn tag(self) -> &'static str {
        match self {
            Source::Server => "SERVER:  ",
            Source::Haml => "HAML:    ",
            Source::Compass => "COMPASS: ",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleLine {
    pub source: Source,
    pub text: String,
}

impl ConsoleLine {
    pub fn new(source: Source, text: impl Into<String>) -> Self {
        ConsoleLine {
            source,
            text: text.into(),
        }
    }
}

/// Print every received line until all senders are gone.
pub fn spawn_console(rx: Receiver<ConsoleLine>) -> JoinHandle<()> {
    thread::spawn(move || {
        let stdout = io::stdout();
        for line in rx {
            let tag = line.source.tag();
            let tag = match line.source {
                Source::Server => tag.cyan(),
                Source::Haml => tag.magenta(),
                Source::Compass => tag.yellow(),
            };
            let mut out = stdout.lock();
            let _ = writeln!(out, "{}{}", tag, line.text);
        }
    })
}

/// Forward each line read from `reader` to the console channel.
fn pipe_lines<R: Read + Send + 'static>(
    reader: R,
    source: Source,
    tx: Sender<ConsoleLine>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        for line in BufReader::new(reader).lines() {
            let Ok(text) = line else { break };
            if tx.send(ConsoleLine::new(source, text)).is_err() {
                break;
            }
        }
    })
}

pub struct Supervisor {
    running: Arc<AtomicBool>,
    tx: Sender<ConsoleLine>,
    children: Vec<(Source, Child)>,
    workers: Vec<(Source, JoinHandle<()>)>,
}

impl Supervisor {
    pub fn new(running: Arc<AtomicBool>, tx: Sender<ConsoleLine>) -> Self {
        Supervisor {
            running,
            tx,
            children: Vec::new(),
            workers: Vec::new(),
        }
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Start an external helper with stdout and stderr piped to the console.
    pub fn spawn_process(&mut self, source: Source, mut command: Command) -> io::Result<()> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = command.spawn()?;
        debug!(?source, pid = child.id(), "helper process started");
        let _ = self.tx.send(ConsoleLine::new(source, "Starting..."));

        if let Some(out) = child.stdout.take() {
            self.workers.push((source, pipe_lines(out, source, self.tx.clone())));
        }
        if let Some(err) = child.stderr.take() {
            self.workers.push((source, pipe_lines(err, source, self.tx.clone())));
        }
        self.children.push((source, child));
        Ok(())
    }

    /// Run `work` on its own thread. It must return once `running` is cleared.
    pub fn spawn_worker<F>(&mut self, source: Source, work: F)
    where
        F: FnOnce(Arc<AtomicBool>, Sender<ConsoleLine>) + Send + 'static,
    {
        let running = self.running();
        let tx = self.tx.clone();
        self.workers.push((source, thread::spawn(move || work(running, tx))));
    }

    /// Block until the running flag is cleared or the server worker ends,
    /// then stop the helper processes and join every worker.
    pub fn run_until_stopped(mut self) {
        while self.running.load(Ordering::SeqCst) {
            let server_done = self
                .workers
                .iter()
                .any(|(source, handle)| *source == Source::Server && handle.is_finished());
            if server_done {
                break;
            }

            for (source, child) in &mut self.children {
                if let Ok(Some(status)) = child.try_wait() {
                    debug!(?source, %status, "helper process exited");
                }
            }
            thread::sleep(Duration::from_millis(200));
        }
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        for (source, child) in &mut self.children {
            if let Ok(None) = child.try_wait() {
                if let Err(e) = child.kill() {
                    warn!(?source, error = %e, "could not stop helper process");
                }
            }
            let _ = child.wait();
        }
        for (source, handle) in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!(?source, "worker thread panicked");
            }
        }
    }
}
