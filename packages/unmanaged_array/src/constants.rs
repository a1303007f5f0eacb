// Only a panic under the write lock can poison a block lock, and release never panics while
// holding it.
pub(crate) const ERR_POISONED_LOCK: &str = "encountered poisoned lock - continued execution \
    is not safe because the buffer contents can no longer be trusted";
