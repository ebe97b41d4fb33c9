use thiserror::Error;

#[derive(Error, Debug)]
pub enum MpscBufError {
    #[error("block capacity must be at least one slot (got {0})")]
    InvalidCapacity(usize),
}
