//! # Code Prompt Assembler
//!
//! Pure prompt rendering: template tokens, the directory tree, and the
//! content-budget truncation policy.
//!
//! ## Tokens
//!
//! ```text
//! {{dirs}}            ### File Structure + rendered tree
//! {{files_provided}}  ### Code Files provided + bullet list
//! {{file_contents}}   ### Code Files + delimited file blocks
//! {{CLIPBOARD}}       raw clipboard text
//! ```
//!
//! Rendering never touches the filesystem; callers pass a content snapshot
//! through [`codeprompt_protocol::ContentLookup`]. A [`RenderJob`] carries the
//! same inputs in owned, serializable form for isolated worker processes.

mod assembler;
mod error;
mod job;
mod placeholders;
mod tree;

pub use assembler::{render, RenderRequest, SectionHeaders};
pub use error::{AssemblerError, Result};
pub use job::{RenderJob, RenderOutcome};
pub use placeholders::{finish, substitute, Substitutions};
pub use tree::{
    root_display_name, DirectoryTree, DEFAULT_MAX_DEPTH, DEFAULT_MAX_LINES, TRUNCATION_MARKER,
};
