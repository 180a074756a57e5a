use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

/// A thread-safe pool of reusable allocations.
///
/// The receive pass borrows one read buffer per dispatch from here instead
/// of allocating a fresh `Vec<u8>` for every readable event. Objects are
/// created lazily when the pool runs dry and are only kept on return while
/// the pool holds fewer than `capacity` of them.
#[derive(Clone)]
pub struct ObjectPool<T> {
    pool: Arc<Mutex<VecDeque<T>>>,
    create_fn: Arc<dyn Fn() -> T + Send + Sync>,
    capacity: usize,
}

impl<T: Default + Send + 'static> ObjectPool<T> {
    /// Creates a pool pre-filled with `initial_size` objects from `create_fn`
    pub fn new<F>(initial_size: usize, create_fn: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        let pool: VecDeque<T> = (0..initial_size).map(|_| create_fn()).collect();

        Self {
            pool: Arc::new(Mutex::new(pool)),
            create_fn: Arc::new(create_fn),
            capacity: initial_size,
        }
    }

    #[inline]
    pub fn acquire(&self) -> PooledObject<T> {
        let object = self
            .pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();

        PooledObject {
            object: object.unwrap_or_else(|| (self.create_fn)()),
            pool: Arc::clone(&self.pool),
            capacity: self.capacity,
        }
    }

    /// Returns the approximate number of idle objects.
    pub fn available(&self) -> usize {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// A guard that returns the object to the pool when dropped.
pub struct PooledObject<T: Default> {
    object: T,
    pool: Arc<Mutex<VecDeque<T>>>,
    capacity: usize,
}

impl<T: Default> std::ops::Deref for PooledObject<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.object
    }
}

impl<T: Default> std::ops::DerefMut for PooledObject<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.object
    }
}

impl<T: Default> Drop for PooledObject<T> {
    #[inline]
    fn drop(&mut self) {
        let mut pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        if pool.len() < self.capacity {
            pool.push_back(std::mem::take(&mut self.object));
        }
    }
}
