use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

/// Callback for decoded application frames, invoked strictly in send order.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FrameDispatcher: Send + Sync + 'static {
    async fn on_frame(&self, frame: Vec<u8>);
}
