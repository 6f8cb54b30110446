use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::MissedTickBehavior;

/// Token bucket shared by every probe task. Cloning shares the bucket.
#[derive(Clone, Debug)]
pub struct RateLimiter {
	sem: Arc<Semaphore>,
}

impl RateLimiter {
	/// Starts empty and refills one token per `1 / tokens_per_sec`, holding at most
	/// one second worth of tokens. Must be called inside a tokio runtime.
	pub fn new(tokens_per_sec: u32) -> Self {
		let tokens_per_sec = tokens_per_sec.max(1);
		let sem = Arc::new(Semaphore::new(0));
		let interval = Duration::from_nanos((1_000_000_000 / tokens_per_sec as u64).max(1));

		// The refill task ends once the last limiter clone is gone
		let weak: Weak<Semaphore> = Arc::downgrade(&sem);
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(interval);
			ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
			loop {
				ticker.tick().await;
				let Some(sem) = weak.upgrade() else {
					break;
				};
				if sem.available_permits() < tokens_per_sec as usize {
					sem.add_permits(1);
				}
			}
		});

		RateLimiter { sem }
	}

	pub async fn acquire(&self) {
		if let Ok(permit) = self.sem.acquire().await {
			permit.forget();
		}
	}
}
