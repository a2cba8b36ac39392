#![allow(dead_code)]

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use beach_pier::remote::{RemoteIo, RemoteSession, SessionBackend, Target};
use bytes::Bytes;

pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    /// Writes the script, then records input until the input pipe closes.
    ReadUntilClosed,
    /// Writes the script and exits without touching input.
    ExitAfterScript,
    /// Echoes every input chunk back as output until the input pipe closes.
    Echo,
    /// Never reads input; exits once the input pipe is closed.
    IgnoreInput,
}

/// What a fake remote observed.
#[derive(Debug, Default)]
pub struct Observed {
    pub ran: AtomicBool,
    pub input: Mutex<Vec<u8>>,
    pub targets: Mutex<Vec<Target>>,
}

impl Observed {
    pub fn input(&self) -> Vec<u8> {
        self.input.lock().unwrap().clone()
    }

    pub fn ran(&self) -> bool {
        self.ran.load(Ordering::SeqCst)
    }

    /// Polls until the recorded input ends with `suffix`.
    pub async fn wait_for_input_suffix(&self, suffix: &[u8]) -> Vec<u8> {
        let deadline = tokio::time::Instant::now() + STEP_TIMEOUT;
        loop {
            let input = self.input();
            if input.ends_with(suffix) || tokio::time::Instant::now() > deadline {
                return input;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

pub struct FakeRemote {
    io: RemoteIo,
    script: Vec<Bytes>,
    behaviour: Behaviour,
    observed: Arc<Observed>,
}

impl FakeRemote {
    pub fn new(
        io: RemoteIo,
        script: Vec<Bytes>,
        behaviour: Behaviour,
        observed: Arc<Observed>,
    ) -> Box<dyn RemoteSession> {
        Box::new(Self {
            io,
            script,
            behaviour,
            observed,
        })
    }
}

#[async_trait]
impl RemoteSession for FakeRemote {
    async fn run(self: Box<Self>) -> Result<()> {
        let FakeRemote {
            io,
            script,
            behaviour,
            observed,
        } = *self;
        observed.ran.store(true, Ordering::SeqCst);
        let RemoteIo {
            mut input, output, ..
        } = io;

        for chunk in script {
            output.write(chunk).await?;
        }
        if behaviour == Behaviour::ExitAfterScript {
            return Ok(());
        }
        if behaviour == Behaviour::IgnoreInput {
            let closer = input.closer();
            while !closer.is_closed() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            return Ok(());
        }

        while let Some(chunk) = input.read().await {
            observed.input.lock().unwrap().extend_from_slice(&chunk);
            if behaviour == Behaviour::Echo {
                let _ = output.write(chunk).await;
            }
        }
        Ok(())
    }
}

pub struct FakeBackend {
    pub behaviour: Behaviour,
    pub observed: Arc<Observed>,
}

impl FakeBackend {
    pub fn new(behaviour: Behaviour) -> Self {
        Self {
            behaviour,
            observed: Arc::new(Observed::default()),
        }
    }
}

impl SessionBackend for FakeBackend {
    fn command_line(&self) -> String {
        "/bin/bash".to_string()
    }

    fn open(&self, target: &Target, io: RemoteIo) -> Result<Box<dyn RemoteSession>> {
        self.observed.targets.lock().unwrap().push(target.clone());
        Ok(FakeRemote::new(
            io,
            Vec::new(),
            self.behaviour,
            Arc::clone(&self.observed),
        ))
    }
}
