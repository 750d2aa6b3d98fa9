use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Raccourci pour les maps partagées, très fréquentes dans le kernel.
pub fn new_map<K, V>() -> Shared<HashMap<K, V>> {
    Arc::new(Mutex::new(HashMap::new()))
}
