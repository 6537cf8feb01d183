use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::JobScheduler;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Init,
    Start,
    Ready,
    Shutdown,
}

#[async_trait::async_trait]
pub trait LifecycleComponent {
    fn name(&self) -> &str;

    async fn on_init(&mut self) -> Result<()> {
        Ok(())
    }
    async fn on_start(&mut self) -> Result<()> {
        Ok(())
    }
    async fn on_shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

pub type SharedComponent = Arc<Mutex<dyn LifecycleComponent + Send + Sync>>;

/// Drives attached components through init → start → shutdown and owns the
/// cron engine they register jobs with.
pub struct LifecycleManager {
    state: LifecycleState,
    components: Vec<SharedComponent>,
    pub scheduler: JobScheduler,
}

impl LifecycleManager {
    pub async fn new() -> Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            state: LifecycleState::Created,
            components: Vec::new(),
            scheduler,
        })
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn attach(&mut self, component: SharedComponent) {
        self.components.push(component);
    }

    pub async fn start(&mut self) -> Result<()> {
        info!("Lifecycle Phase: Init");
        self.state = LifecycleState::Init;
        for comp in &self.components {
            comp.lock().await.on_init().await?;
        }

        info!("Lifecycle Phase: Start");
        self.state = LifecycleState::Start;
        for comp in &self.components {
            let mut comp = comp.lock().await;
            comp.on_start().await?;
            info!("Component [{}] started", comp.name());
        }

        info!("Lifecycle Phase: Ready (starting cron engine)");
        self.scheduler.start().await?;
        self.state = LifecycleState::Ready;
        Ok(())
    }

    /// Shuts components down in reverse order. Failures are logged, not
    /// returned, so every component gets its turn.
    pub async fn shutdown(&mut self) -> Result<()> {
        if self.state == LifecycleState::Shutdown {
            return Ok(());
        }
        info!("Lifecycle Phase: Shutdown");
        self.state = LifecycleState::Shutdown;

        for comp in self.components.iter().rev() {
            let mut comp = comp.lock().await;
            if let Err(e) = comp.on_shutdown().await {
                warn!("Component [{}] shutdown error: {}", comp.name(), e);
            }
        }
        if let Err(e) = self.scheduler.shutdown().await {
            warn!("Cron engine shutdown error: {}", e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe {
        name: String,
        log: Arc<std::sync::Mutex<Vec<String>>>,
        fail_shutdown: bool,
    }

    #[async_trait::async_trait]
    impl LifecycleComponent for Probe {
        fn name(&self) -> &str {
            &self.name
        }
        async fn on_init(&mut self) -> Result<()> {
            self.log.lock().unwrap().push(format!("init:{}", self.name));
            Ok(())
        }
        async fn on_start(&mut self) -> Result<()> {
            self.log.lock().unwrap().push(format!("start:{}", self.name));
            Ok(())
        }
        async fn on_shutdown(&mut self) -> Result<()> {
            self.log.lock().unwrap().push(format!("stop:{}", self.name));
            if self.fail_shutdown {
                anyhow::bail!("refused");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn phases_run_in_order_and_shutdown_reverses() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut lifecycle = LifecycleManager::new().await.unwrap();
        for (name, fail) in [("a", true), ("b", false)] {
            lifecycle.attach(Arc::new(Mutex::new(Probe {
                name: name.to_string(),
                log: log.clone(),
                fail_shutdown: fail,
            })));
        }

        lifecycle.start().await.unwrap();
        assert_eq!(lifecycle.state(), LifecycleState::Ready);
        lifecycle.shutdown().await.unwrap();
        lifecycle.shutdown().await.unwrap();
        assert_eq!(lifecycle.state(), LifecycleState::Shutdown);

        assert_eq!(
            *log.lock().unwrap(),
            vec!["init:a", "init:b", "start:a", "start:b", "stop:b", "stop:a"]
        );
    }
}
