pub mod error;
pub mod events;
pub mod id;
pub mod pagination;
pub mod post;

pub use error::{CoreError, Result};
pub use events::{CHANGE_TASK_EVENT_TYPE, ChangeTaskEvent, ChangeType, MESSAGE_TYPE_HEADER};
pub use id::{IdError, SortableId};
pub use pagination::{Cursor, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, Pagination};
pub use post::{CodecError, POST_REF_LEN, PostRef, merge_newest_first};
