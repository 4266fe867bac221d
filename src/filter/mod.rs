//! The preprocessing filters an XZ block may apply before LZMA2: the BCJ
//! branch converters and the Delta filter.

pub mod bcj;
pub mod delta;
