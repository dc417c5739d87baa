use tokio::task::JoinHandle;
use tracing::debug;

/// Guarda como mucho una tarea diferida. Armar siempre cancela la anterior;
/// soltar el slot cancela lo que esté armado.
#[derive(Debug, Default)]
pub struct TimerSlot {
    handle: Option<JoinHandle<()>>,
    epoch: u64,
}

impl TimerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserva la época que la próxima tarea armada debe presentar al vencer.
    pub fn next_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }

    pub fn arm(&mut self, handle: JoinHandle<()>) {
        self.cancel();
        self.handle = Some(handle);
    }

    pub fn cancel(&mut self) -> bool {
        match self.handle.take() {
            Some(handle) => {
                handle.abort();
                debug!("⏲️ Temporizador de inactividad cancelado");
                true
            }
            None => false,
        }
    }

    /// Se llama desde la tarea que vence: olvida el handle sin abortarlo, así
    /// la tarea puede terminar su propia limpieza. Devuelve `false` si la tarea
    /// que vence no es la armada.
    pub fn claim(&mut self, epoch: u64) -> bool {
        if epoch != self.epoch || self.handle.is_none() {
            return false;
        }
        self.handle = None;
        true
    }

    pub fn is_armed(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    fn counting_task(counter: Arc<AtomicUsize>, delay: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearming_cancels_previous_task() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut slot = TimerSlot::new();

        slot.arm(counting_task(fired.clone(), Duration::from_secs(10)));
        slot.arm(counting_task(fired.clone(), Duration::from_secs(10)));
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_and_drop_abort() {
        let fired = Arc::new(AtomicUsize::new(0));

        let mut slot = TimerSlot::new();
        slot.arm(counting_task(fired.clone(), Duration::from_secs(5)));
        assert!(slot.cancel());
        assert!(!slot.cancel());

        {
            let mut dropped = TimerSlot::new();
            dropped.arm(counting_task(fired.clone(), Duration::from_secs(5)));
        }

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!slot.is_armed());
    }

    #[tokio::test]
    async fn test_claim_requires_current_epoch() {
        let mut slot = TimerSlot::new();
        let stale = slot.next_epoch();
        let current = slot.next_epoch();
        slot.arm(tokio::spawn(async {}));

        assert!(!slot.claim(stale));
        assert!(slot.claim(current));
        assert!(!slot.is_armed());
    }
}
