//! Platform adapters for Ethereal Tunes: the software audio runtime, CPAL
//! output and file-backed preset storage

pub mod audio;
pub mod storage;
