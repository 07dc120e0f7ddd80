use parking_lot::Mutex;
use std::sync::Arc;

/// Handle shared between a connector and the key scope it hands out
pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}
