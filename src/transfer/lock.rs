/// Advisory job locks on owning containers

use crate::error::{ContainerError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Busy flags held by one transfer job, released on drop
#[derive(Debug)]
pub(crate) struct JobLock {
    held: Vec<Arc<AtomicBool>>,
}

impl JobLock {
    /// Take every flag, or none of them
    pub(crate) fn acquire(flags: Vec<(String, Arc<AtomicBool>)>) -> Result<Self> {
        let mut lock = JobLock { held: Vec::new() };
        for (name, flag) in flags {
            if flag
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return Err(ContainerError::Busy(name));
            }
            lock.held.push(flag);
        }
        Ok(lock)
    }
}

impl Drop for JobLock {
    fn drop(&mut self) {
        for flag in &self.held {
            flag.store(false, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flag() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(false))
    }

    #[test]
    fn test_second_job_rejected() {
        let owner = flag();
        let first = JobLock::acquire(vec![("disk".to_string(), owner.clone())]).unwrap();
        assert!(matches!(
            JobLock::acquire(vec![("disk".to_string(), owner.clone())]),
            Err(ContainerError::Busy(_))
        ));
        drop(first);
        assert!(JobLock::acquire(vec![("disk".to_string(), owner)]).is_ok());
    }

    #[test]
    fn test_partial_acquire_released() {
        let (a, b) = (flag(), flag());
        b.store(true, Ordering::Release);
        let result = JobLock::acquire(vec![("a".to_string(), a.clone()), ("b".to_string(), b)]);
        assert!(result.is_err());
        assert!(!a.load(Ordering::Acquire));
    }
}
