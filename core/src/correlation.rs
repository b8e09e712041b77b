//! Correlation id propagation.
//!
//! A handler runs inside [`scope`]; anything it publishes while the scope is
//! active inherits the same correlation id, so one purchase can be followed
//! across every service it touches.

use std::future::Future;

tokio::task_local! {
    static CORRELATION_ID: String;
}

/// Runs `future` with `correlation_id` as the active correlation id.
pub async fn scope<F>(correlation_id: String, future: F) -> F::Output
where
    F: Future,
{
    CORRELATION_ID.scope(correlation_id, future).await
}

/// The correlation id of the current scope, if one is active.
#[must_use]
pub fn current() -> Option<String> {
    CORRELATION_ID.try_with(Clone::clone).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn current_is_none_outside_a_scope() {
        assert_eq!(current(), None);
    }

    #[tokio::test]
    async fn nested_scopes_shadow_the_outer_id() {
        let seen = scope("outer".to_string(), async {
            let inner = scope("inner".to_string(), async { current() }).await;
            (current(), inner)
        })
        .await;

        assert_eq!(seen, (Some("outer".to_string()), Some("inner".to_string())));
    }
}
