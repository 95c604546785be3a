use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// 缓存容量必须为正数。
    #[error("invalid cache capacity: {0}")]
    InvalidCapacity(usize),
}
