mod backend;
pub use backend::{Backend, Client, SyncError};

mod comment;
pub use comment::{CommentNode, CommentTree};

mod inbox;
pub use inbox::{NotificationInbox, POLL_INTERVAL};

mod thread;
pub use thread::{CommentThread, RowState};

pub mod api {
    pub use remark_api::*;
}
