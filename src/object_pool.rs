use std::{
    collections::VecDeque,
    fmt,
    ops::{Deref, DerefMut},
    sync::{Arc, Mutex},
};

/// Resets an object before it goes back into an [`ObjectPool`].
pub trait Recycle {
    fn recycle(&mut self);
}

impl Recycle for Vec<u8> {
    fn recycle(&mut self) {
        self.clear();
    }
}

/// Thread-safe pool of reusable objects.
///
/// Objects are created lazily when the pool is empty and returned on drop of
/// the [`PooledObject`] guard, up to `capacity` retained objects.
pub struct ObjectPool<T> {
    pool: Arc<Mutex<VecDeque<T>>>,
    create_fn: Arc<dyn Fn() -> T + Send + Sync>,
    capacity: usize,
}

impl<T> Clone for ObjectPool<T> {
    fn clone(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
            create_fn: Arc::clone(&self.create_fn),
            capacity: self.capacity,
        }
    }
}

impl<T> fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectPool")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl<T: Recycle + Send + 'static> ObjectPool<T> {
    /// Creates a pool holding `initial_size` objects built by `create_fn`.
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
        let object = lock(&self.pool).pop_front();
        let object = object.unwrap_or_else(|| (self.create_fn)());

        PooledObject {
            object: Some(object),
            pool: Arc::clone(&self.pool),
            capacity: self.capacity,
        }
    }

    /// Number of idle objects currently held.
    pub fn available(&self) -> usize {
        lock(&self.pool).len()
    }
}

// A poisoned pool only means a panic happened mid push/pop; the deque itself
// is still consistent.
fn lock<T>(pool: &Mutex<VecDeque<T>>) -> std::sync::MutexGuard<'_, VecDeque<T>> {
    pool.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Guard that recycles the object and returns it to the pool when dropped.
pub struct PooledObject<T: Recycle> {
    object: Option<T>,
    pool: Arc<Mutex<VecDeque<T>>>,
    capacity: usize,
}

impl<T: Recycle + fmt::Debug> fmt::Debug for PooledObject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PooledObject").field(&self.object).finish()
    }
}

impl<T: Recycle> Deref for PooledObject<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // only `drop` takes the object out
        self.object.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<T: Recycle> DerefMut for PooledObject<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        self.object.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<T: Recycle> Drop for PooledObject<T> {
    fn drop(&mut self) {
        if let Some(mut object) = self.object.take() {
            object.recycle();
            let mut pool = lock(&self.pool);
            if pool.len() < self.capacity {
                pool.push_back(object);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_acquire_and_return() {
        let pool = ObjectPool::new(2, || Vec::<u8>::with_capacity(16));
        assert_eq!(pool.available(), 2);

        {
            let mut buf = pool.acquire();
            buf.extend_from_slice(b"abc");
            assert_eq!(pool.available(), 1);
        }

        assert_eq!(pool.available(), 2);
        let buf = pool.acquire();
        assert!(buf.is_empty(), "returned objects are recycled");
    }

    #[test]
    fn test_grows_past_initial_size_but_retains_capacity() {
        let pool = ObjectPool::new(1, Vec::<u8>::new);
        let a = pool.acquire();
        let b = pool.acquire();
        assert_eq!(pool.available(), 0);

        drop(a);
        drop(b);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_shared_across_threads() {
        let pool = ObjectPool::new(4, Vec::<u8>::new);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        let mut buf = pool.acquire();
                        buf.push(1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.available(), 4);
    }
}
