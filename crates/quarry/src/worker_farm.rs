use std::sync::Arc;

pub type WorkerFarmRef = Arc<dyn WorkerFarm + Send + Sync>;

/// Compute pool handle forwarded to request bodies. The tracker never
/// schedules work on it itself; requests use it to offload pure compute
/// and coordinate results over their own channels.
pub trait WorkerFarm {
  fn execute(&self, job: Box<dyn FnOnce() + Send + 'static>);
}

/// Rayon-backed farm.
pub struct RayonFarm {
  pool: rayon::ThreadPool,
}

impl RayonFarm {
  pub fn new(threads: usize) -> anyhow::Result<Self> {
    let pool = rayon::ThreadPoolBuilder::new()
      .num_threads(threads)
      .build()?;
    Ok(Self { pool })
  }
}

impl WorkerFarm for RayonFarm {
  fn execute(&self, job: Box<dyn FnOnce() + Send + 'static>) {
    self.pool.spawn(job);
  }
}
