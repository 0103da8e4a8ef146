use tokio::time::{self, Duration, Instant};
use tracing::{debug, info, warn};

use crate::api::UserClient;
use crate::errors::Error;
use crate::metrics::ACTIVE_USERS;

/// Settings for one simulated user task.
#[derive(Debug, Clone)]
pub struct UserConfig {
    pub user_index: usize,
    pub test_duration: Duration,
    pub poll_interval: Duration,
}

/// How a user task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserOutcome {
    /// The test duration ran out while the user was still active.
    Finished,
    /// The service was too slow and the user gave up.
    Retired,
    /// A non-retirement error stopped the user.
    Failed,
}

/// Drives one simulated user: sign up, sign in, load the top page, then poll
/// `/info` until the test duration ends or the user retires.
pub async fn run_user(mut user: UserClient, config: UserConfig, start_time: Instant) -> UserOutcome {
    ACTIVE_USERS.inc();
    let outcome = drive(&mut user, &config, start_time).await;
    ACTIVE_USERS.dec();

    match outcome {
        Ok(()) => {
            info!(user = config.user_index, "User finished");
            UserOutcome::Finished
        }
        Err(e) if e.is_retirement() => {
            info!(user = config.user_index, error = %e, "User retired");
            UserOutcome::Retired
        }
        Err(e) => {
            warn!(
                user = config.user_index,
                error = %e,
                error_category = e.category().label(),
                "User stopped on error"
            );
            UserOutcome::Failed
        }
    }
}

async fn drive(user: &mut UserClient, config: &UserConfig, start_time: Instant) -> Result<(), Error> {
    user.signup().await?;
    let me = user.signin().await?;
    debug!(user = config.user_index, user_id = me.id, "Signed in");
    user.top().await?;

    let mut cursor = 0;
    let mut next_poll = Instant::now();
    loop {
        time::sleep_until(next_poll).await;
        if start_time.elapsed() >= config.test_duration {
            return Ok(());
        }
        next_poll += config.poll_interval;

        let info = user.info(cursor).await?;
        debug!(
            user = config.user_index,
            cursor = info.cursor,
            traded = info.traded_orders.len(),
            "Polled info"
        );
        cursor = info.cursor;
    }
}
