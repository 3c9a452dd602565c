use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// One epoch's summary statistics, appended to a split's learning curve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurvePoint {
    pub epoch: usize,
    pub lower_bound: f64,
    pub reconstruction_error: f64,
    pub kl_divergence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kl_divergence_y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kl_divergence_neurons: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Training,
    Validation,
}

impl Split {
    fn dir_name(&self) -> &'static str {
        match self {
            Split::Training => "training",
            Split::Validation => "validation",
        }
    }
}

/// Snapshot slots kept beside the rolling epoch checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
    EarlyStopping,
    Best,
}

impl SnapshotKind {
    fn dir_name(&self) -> &'static str {
        match self {
            SnapshotKind::EarlyStopping => "early_stopping",
            SnapshotKind::Best => "best",
        }
    }
}

/// Persistence behind the training controller: epoch checkpoints,
/// snapshot slots, learning curves, a metadata log, and a run lock.
pub trait ModelRepository {
    fn save_epoch(&self, varmap: &VarMap, epoch: usize) -> anyhow::Result<()>;
    fn load_epoch(&self, varmap: &mut VarMap, epoch: usize) -> anyhow::Result<()>;
    fn list_epochs(&self) -> anyhow::Result<Vec<usize>>;
    /// Delete every epoch checkpoint except the most recent.
    fn prune_to_latest(&self) -> anyhow::Result<()>;

    fn save_snapshot(&self, kind: SnapshotKind, varmap: &VarMap, epoch: usize)
    -> anyhow::Result<()>;
    /// Fill a snapshot slot from an already-saved epoch checkpoint.
    fn snapshot_from_epoch(&self, kind: SnapshotKind, epoch: usize) -> anyhow::Result<()>;
    fn load_snapshot(&self, kind: SnapshotKind, varmap: &mut VarMap) -> anyhow::Result<()>;
    fn snapshot_epoch(&self, kind: SnapshotKind) -> anyhow::Result<Option<usize>>;
    fn clear_snapshot(&self, kind: SnapshotKind) -> anyhow::Result<()>;

    fn append_curve_point(&self, split: Split, point: &CurvePoint) -> anyhow::Result<()>;
    fn load_curves(&self, split: Split) -> anyhow::Result<Vec<CurvePoint>>;

    fn append_metadata(&self, line: &str) -> anyhow::Result<()>;

    fn acquire_lock(&self) -> anyhow::Result<()>;
    fn release_lock(&self) -> anyhow::Result<()>;

    fn latest_epoch(&self) -> anyhow::Result<Option<usize>> {
        Ok(self.list_epochs()?.into_iter().max())
    }
}

/// On-disk layout: `{log_root}/{model_name}/run_{id}/` with
/// `epoch_{n}.safetensors`, `metadata_log`, a `run.lock`, and
/// `training/ validation/ early_stopping/ best/` subdirectories.
pub struct DiskRepository {
    run_dir: PathBuf,
}

impl DiskRepository {
    pub fn new(log_root: &Path, model_name: &str, run_id: &str) -> anyhow::Result<Self> {
        let run_dir = log_root.join(model_name).join(format!("run_{}", run_id));
        for sub in ["training", "validation", "early_stopping", "best"] {
            std::fs::create_dir_all(run_dir.join(sub))?;
        }
        Ok(Self { run_dir })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    fn epoch_path(&self, epoch: usize) -> PathBuf {
        self.run_dir.join(format!("epoch_{}.safetensors", epoch))
    }

    fn snapshot_paths(&self, kind: SnapshotKind) -> (PathBuf, PathBuf) {
        let dir = self.run_dir.join(kind.dir_name());
        (dir.join("model.safetensors"), dir.join("epoch"))
    }

    fn curve_path(&self, split: Split) -> PathBuf {
        self.run_dir
            .join(split.dir_name())
            .join("learning_curves.jsonl")
    }
}

impl ModelRepository for DiskRepository {
    fn save_epoch(&self, varmap: &VarMap, epoch: usize) -> anyhow::Result<()> {
        varmap.save(self.epoch_path(epoch))?;
        Ok(())
    }

    fn load_epoch(&self, varmap: &mut VarMap, epoch: usize) -> anyhow::Result<()> {
        let path = self.epoch_path(epoch);
        anyhow::ensure!(path.exists(), "missing checkpoint: {}", path.display());
        varmap.load(path)?;
        Ok(())
    }

    fn list_epochs(&self) -> anyhow::Result<Vec<usize>> {
        let mut epochs = vec![];
        for entry in std::fs::read_dir(&self.run_dir)? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(rest) = name
                .strip_prefix("epoch_")
                .and_then(|s| s.strip_suffix(".safetensors"))
            {
                if let Ok(epoch) = rest.parse::<usize>() {
                    epochs.push(epoch);
                }
            }
        }
        epochs.sort_unstable();
        Ok(epochs)
    }

    fn prune_to_latest(&self) -> anyhow::Result<()> {
        let epochs = self.list_epochs()?;
        if let Some(&last) = epochs.last() {
            for epoch in epochs.iter().filter(|&&e| e != last) {
                std::fs::remove_file(self.epoch_path(*epoch))?;
            }
        }
        Ok(())
    }

    fn save_snapshot(
        &self,
        kind: SnapshotKind,
        varmap: &VarMap,
        epoch: usize,
    ) -> anyhow::Result<()> {
        let (model_path, epoch_path) = self.snapshot_paths(kind);
        varmap.save(model_path)?;
        std::fs::write(epoch_path, epoch.to_string())?;
        Ok(())
    }

    fn snapshot_from_epoch(&self, kind: SnapshotKind, epoch: usize) -> anyhow::Result<()> {
        let source = self.epoch_path(epoch);
        anyhow::ensure!(source.exists(), "missing checkpoint: {}", source.display());
        let (model_path, epoch_path) = self.snapshot_paths(kind);
        std::fs::copy(source, model_path)?;
        std::fs::write(epoch_path, epoch.to_string())?;
        Ok(())
    }

    fn load_snapshot(&self, kind: SnapshotKind, varmap: &mut VarMap) -> anyhow::Result<()> {
        let (model_path, _) = self.snapshot_paths(kind);
        anyhow::ensure!(
            model_path.exists(),
            "missing {} snapshot: {}",
            kind.dir_name(),
            model_path.display()
        );
        varmap.load(model_path)?;
        Ok(())
    }

    fn snapshot_epoch(&self, kind: SnapshotKind) -> anyhow::Result<Option<usize>> {
        let (_, epoch_path) = self.snapshot_paths(kind);
        if !epoch_path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(epoch_path)?;
        Ok(Some(text.trim().parse::<usize>()?))
    }

    fn clear_snapshot(&self, kind: SnapshotKind) -> anyhow::Result<()> {
        let (model_path, epoch_path) = self.snapshot_paths(kind);
        for path in [model_path, epoch_path] {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    fn append_curve_point(&self, split: Split, point: &CurvePoint) -> anyhow::Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.curve_path(split))?;
        writeln!(file, "{}", serde_json::to_string(point)?)?;
        Ok(())
    }

    fn load_curves(&self, split: Split) -> anyhow::Result<Vec<CurvePoint>> {
        let path = self.curve_path(split);
        if !path.exists() {
            return Ok(vec![]);
        }
        let text = std::fs::read_to_string(path)?;
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| Ok(serde_json::from_str(l)?))
            .collect()
    }

    fn append_metadata(&self, line: &str) -> anyhow::Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.run_dir.join("metadata_log"))?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    fn acquire_lock(&self) -> anyhow::Result<()> {
        let path = self.run_dir.join("run.lock");
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                writeln!(file, "{}", std::process::id())?;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(anyhow::anyhow!(
                "run already in progress, lock held: {}",
                path.display()
            )),
            Err(e) => Err(e.into()),
        }
    }

    fn release_lock(&self) -> anyhow::Result<()> {
        let path = self.run_dir.join("run.lock");
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

type TensorDump = HashMap<String, candle_core::Tensor>;

#[derive(Default)]
struct MemoryState {
    epochs: BTreeMap<usize, TensorDump>,
    snapshots: HashMap<&'static str, (TensorDump, usize)>,
    curves: HashMap<&'static str, Vec<CurvePoint>>,
    metadata: Vec<String>,
    locked: bool,
}

/// In-memory repository for controller tests.
#[derive(Default)]
pub struct MemoryRepository {
    state: Mutex<MemoryState>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn dump(varmap: &VarMap) -> anyhow::Result<TensorDump> {
        let data = varmap.data().lock().map_err(|_| anyhow::anyhow!("varmap lock"))?;
        let mut out = HashMap::with_capacity(data.len());
        for (name, var) in data.iter() {
            out.insert(name.clone(), var.as_tensor().copy()?);
        }
        Ok(out)
    }

    fn restore(varmap: &VarMap, dump: &TensorDump) -> anyhow::Result<()> {
        let data = varmap.data().lock().map_err(|_| anyhow::anyhow!("varmap lock"))?;
        for (name, var) in data.iter() {
            let tensor = dump
                .get(name)
                .ok_or_else(|| anyhow::anyhow!("missing variable in dump: {}", name))?;
            var.set(tensor)?;
        }
        Ok(())
    }

    fn lock(&self) -> anyhow::Result<std::sync::MutexGuard<'_, MemoryState>> {
        self.state.lock().map_err(|_| anyhow::anyhow!("state lock"))
    }
}

impl ModelRepository for MemoryRepository {
    fn save_epoch(&self, varmap: &VarMap, epoch: usize) -> anyhow::Result<()> {
        let dump = Self::dump(varmap)?;
        self.lock()?.epochs.insert(epoch, dump);
        Ok(())
    }

    fn load_epoch(&self, varmap: &mut VarMap, epoch: usize) -> anyhow::Result<()> {
        let state = self.lock()?;
        let dump = state
            .epochs
            .get(&epoch)
            .ok_or_else(|| anyhow::anyhow!("missing checkpoint for epoch {}", epoch))?;
        Self::restore(varmap, dump)
    }

    fn list_epochs(&self) -> anyhow::Result<Vec<usize>> {
        Ok(self.lock()?.epochs.keys().copied().collect())
    }

    fn prune_to_latest(&self) -> anyhow::Result<()> {
        let mut state = self.lock()?;
        if let Some(&last) = state.epochs.keys().max() {
            state.epochs.retain(|&e, _| e == last);
        }
        Ok(())
    }

    fn save_snapshot(
        &self,
        kind: SnapshotKind,
        varmap: &VarMap,
        epoch: usize,
    ) -> anyhow::Result<()> {
        let dump = Self::dump(varmap)?;
        self.lock()?.snapshots.insert(kind.dir_name(), (dump, epoch));
        Ok(())
    }

    fn snapshot_from_epoch(&self, kind: SnapshotKind, epoch: usize) -> anyhow::Result<()> {
        let mut state = self.lock()?;
        let dump = state
            .epochs
            .get(&epoch)
            .ok_or_else(|| anyhow::anyhow!("missing checkpoint for epoch {}", epoch))?
            .clone();
        state.snapshots.insert(kind.dir_name(), (dump, epoch));
        Ok(())
    }

    fn load_snapshot(&self, kind: SnapshotKind, varmap: &mut VarMap) -> anyhow::Result<()> {
        let state = self.lock()?;
        let (dump, _) = state
            .snapshots
            .get(kind.dir_name())
            .ok_or_else(|| anyhow::anyhow!("missing {} snapshot", kind.dir_name()))?;
        Self::restore(varmap, dump)
    }

    fn snapshot_epoch(&self, kind: SnapshotKind) -> anyhow::Result<Option<usize>> {
        Ok(self
            .lock()?
            .snapshots
            .get(kind.dir_name())
            .map(|(_, e)| *e))
    }

    fn clear_snapshot(&self, kind: SnapshotKind) -> anyhow::Result<()> {
        self.lock()?.snapshots.remove(kind.dir_name());
        Ok(())
    }

    fn append_curve_point(&self, split: Split, point: &CurvePoint) -> anyhow::Result<()> {
        self.lock()?
            .curves
            .entry(split.dir_name())
            .or_default()
            .push(point.clone());
        Ok(())
    }

    fn load_curves(&self, split: Split) -> anyhow::Result<Vec<CurvePoint>> {
        Ok(self
            .lock()?
            .curves
            .get(split.dir_name())
            .cloned()
            .unwrap_or_default())
    }

    fn append_metadata(&self, line: &str) -> anyhow::Result<()> {
        self.lock()?.metadata.push(line.to_string());
        Ok(())
    }

    fn acquire_lock(&self) -> anyhow::Result<()> {
        let mut state = self.lock()?;
        anyhow::ensure!(!state.locked, "run already in progress");
        state.locked = true;
        Ok(())
    }

    fn release_lock(&self) -> anyhow::Result<()> {
        self.lock()?.locked = false;
        Ok(())
    }
}
