//! A thread pool which runs a closure in parallel.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::{bail, format_err, Error};
use crossbeam_channel::{bounded, Sender};

type AbortSlot = Arc<Mutex<Option<Error>>>;

/// A handle to send data to the worker thread (implements clone)
pub struct SendHandle<I> {
    input: Sender<I>,
    abort: AbortSlot,
}

impl<I: Send + Sync + 'static> SendHandle<I> {
    /// Returns the first error happened, if any
    pub fn check_abort(&self) -> Result<(), Error> {
        let guard = self.abort.lock().unwrap();
        if let Some(err) = &*guard {
            return Err(format_err!("{}", err));
        }
        Ok(())
    }

    /// Send data to the worker threads
    pub fn send(&self, input: I) -> Result<(), Error> {
        self.check_abort()?;
        self.input.send(input)?;
        Ok(())
    }
}

impl<I> Clone for SendHandle<I> {
    fn clone(&self) -> Self {
        Self {
            input: self.input.clone(),
            abort: Arc::clone(&self.abort),
        }
    }
}

/// A thread pool which run the supplied closure
///
/// The send command sends data to the worker threads. If one handler
/// returns an error, we mark the channel as failed and it is no
/// longer possible to send data.
///
/// When done, the 'complete()' method needs to be called to check for
/// outstanding errors. It returns the first handler error unchanged, so
/// typed errors survive for `downcast_ref`.
pub struct ParallelHandler<I> {
    handles: Vec<JoinHandle<()>>,
    name: String,
    input: Option<SendHandle<I>>,
    abort: AbortSlot,
}

impl<I: Send + Sync + 'static> ParallelHandler<I> {
    /// Create a new thread pool, each thread processing incoming data
    /// with 'handler_fn'.
    pub fn new<F>(name: &str, threads: usize, handler_fn: F) -> Result<Self, Error>
    where
        F: Fn(I) -> Result<(), Error> + Send + Clone + 'static,
    {
        let mut handles = Vec::new();
        let (input_tx, input_rx) = bounded::<I>(threads);

        let abort: AbortSlot = Arc::new(Mutex::new(None));

        for i in 0..threads {
            let input_rx = input_rx.clone();
            let abort = Arc::clone(&abort);
            let handler_fn = handler_fn.clone();

            handles.push(
                std::thread::Builder::new()
                    .name(format!("{} ({})", name, i))
                    .spawn(move || loop {
                        let data = match input_rx.recv() {
                            Ok(data) => data,
                            Err(_) => return,
                        };
                        if let Err(err) = (handler_fn)(data) {
                            let mut guard = abort.lock().unwrap();
                            if guard.is_none() {
                                *guard = Some(err);
                            }
                        }
                    })
                    .map_err(|err| format_err!("unable to spawn thread {} ({}) - {}", name, i, err))?,
            );
        }
        Ok(Self {
            handles,
            name: name.to_string(),
            input: Some(SendHandle {
                input: input_tx,
                abort: Arc::clone(&abort),
            }),
            abort,
        })
    }

    /// Returns a cloneable channel to send data to the worker threads
    pub fn channel(&self) -> Result<SendHandle<I>, Error> {
        match &self.input {
            Some(input) => Ok(input.clone()),
            None => bail!("{} - channel already closed", self.name),
        }
    }

    /// Send data to the worker threads
    pub fn send(&self, input: I) -> Result<(), Error> {
        self.channel()?.send(input)
    }

    /// Wait for worker threads to complete and check for errors
    pub fn complete(mut self) -> Result<(), Error> {
        drop(self.input.take());

        let msg_list = self.join_threads();

        if let Some(err) = self.abort.lock().unwrap().take() {
            return Err(err);
        }
        if msg_list.is_empty() {
            return Ok(());
        }
        Err(format_err!("{}", msg_list.join("\n")))
    }

    fn join_threads(&mut self) -> Vec<String> {
        let mut msg_list = Vec::new();

        for (i, handle) in self.handles.drain(..).enumerate() {
            if let Err(panic) = handle.join() {
                match panic.downcast::<&str>() {
                    Ok(panic_msg) => msg_list.push(format!(
                        "thread {} ({}) panicked: {}",
                        self.name, i, panic_msg
                    )),
                    Err(_) => msg_list.push(format!("thread {} ({}) panicked", self.name, i)),
                }
            }
        }
        msg_list
    }
}

// Note: We make sure that all threads will be joined
impl<I> Drop for ParallelHandler<I> {
    fn drop(&mut self) {
        drop(self.input.take());
        while let Some(handle) = self.handles.pop() {
            let _ = handle.join();
        }
    }
}
