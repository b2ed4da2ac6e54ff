//! Pipeline stages for turning dataset records into training batches.
//!
//! Each submodule implements exactly one transformation step and is tested
//! on its own.
//!
//! ## Data Flow
//!
//! ```text
//! dataset ──▶ messages ──▶ template ──▶ processor ──▶ collate
//! (JSON/L)    (normalize)  (chat text)  (ids, pixels)  (labels, Batch)
//!                                           ▲
//!                                         image
//!                                     (load, resize)
//! ```
//!
//! 1. [`dataset`]  : discover the dataset file, parse, filter by subset
//!    marker, seeded shuffle and train/eval split
//! 2. [`messages`] : map raw turns onto `user`/`assistant` messages, the
//!    first user turn carrying the image
//! 3. [`template`] : render messages into chat-formatted text
//! 4. [`image`]    : resolve, decode and normalise images
//! 5. [`processor`]: expand image markers, tokenize, truncate, right-pad
//! 6. [`collate`]  : assemble a [`collate::Batch`] with masked labels;
//!    runs on the blocking pool because decoding and resizing are CPU-bound

pub mod collate;
pub mod dataset;
pub mod image;
pub mod messages;
pub mod processor;
pub mod template;
