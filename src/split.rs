use std::collections::BTreeMap;

use burn::config::Config;
use ndarray::{Array2, Axis};
use rand::{seq::SliceRandom, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::{
    data::ImageDataset,
    error::{Error, Result},
};

#[derive(Config, Debug)]
pub struct SplitConfig {
    #[config(default = 0.2)]
    pub test_fraction: f64,

    #[config(default = 42)]
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitIndices {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// Partitions sample positions so each class keeps its share in both halves.
///
/// `n_test = ceil(test_fraction * n)`; per-class test counts are proportional,
/// rounded by largest remainder. The same `classes` and `config` always give
/// the same partition.
pub fn stratified_split(classes: &[usize], config: &SplitConfig) -> Result<SplitIndices> {
    if !(config.test_fraction > 0.0 && config.test_fraction < 1.0) {
        return Err(Error::Config(format!(
            "test fraction must lie in (0, 1), got {}",
            config.test_fraction
        )));
    }

    let total = classes.len();
    let test_count = (config.test_fraction * total as f64).ceil() as usize;
    let train_count = total - test_count.min(total);

    let mut members: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (index, &class) in classes.iter().enumerate() {
        members.entry(class).or_default().push(index);
    }

    if let Some((class, group)) = members.iter().find(|(_, group)| group.len() < 2) {
        return Err(Error::Split(format!(
            "class {class} has {} sample(s), at least 2 are required",
            group.len()
        )));
    }
    if test_count < members.len() || train_count < members.len() {
        return Err(Error::Split(format!(
            "{total} samples give {train_count} train / {test_count} test, \
             fewer than the {} classes",
            members.len()
        )));
    }

    let quotas = allocate(&members, total, test_count);

    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let mut train = Vec::with_capacity(train_count);
    let mut test = Vec::with_capacity(test_count);

    for (mut group, quota) in members.into_values().zip(quotas) {
        group.shuffle(&mut rng);
        let (test_part, train_part) = group.split_at(quota);
        test.extend_from_slice(test_part);
        train.extend_from_slice(train_part);
    }

    train.shuffle(&mut rng);
    test.shuffle(&mut rng);

    Ok(SplitIndices { train, test })
}

fn allocate(members: &BTreeMap<usize, Vec<usize>>, total: usize, test_count: usize) -> Vec<usize> {
    let exact: Vec<f64> = members
        .values()
        .map(|group| test_count as f64 * group.len() as f64 / total as f64)
        .collect();
    let mut quotas: Vec<usize> = exact.iter().map(|e| e.floor() as usize).collect();

    let mut order: Vec<usize> = (0..exact.len()).collect();
    order.sort_by(|&a, &b| {
        let (fa, fb) = (exact[a].fract(), exact[b].fract());
        fb.total_cmp(&fa).then(a.cmp(&b))
    });

    let sizes: Vec<usize> = members.values().map(Vec::len).collect();
    let mut remaining = test_count - quotas.iter().sum::<usize>();
    for &i in order.iter().cycle().take(order.len() * 2) {
        if remaining == 0 {
            break;
        }
        if quotas[i] < sizes[i] {
            quotas[i] += 1;
            remaining -= 1;
        }
    }

    quotas
}

/// The four arrays handed from the splitter to the trainer.
pub struct DatasetSplit {
    pub train_images: ImageDataset,
    pub train_targets: Array2<f32>,
    pub test_images: ImageDataset,
    pub test_targets: Array2<f32>,
}

impl DatasetSplit {
    pub fn new(images: &ImageDataset, targets: &Array2<f32>, indices: &SplitIndices) -> Self {
        Self {
            train_images: images.subset(&indices.train),
            train_targets: targets.select(Axis(0), &indices.train),
            test_images: images.subset(&indices.test),
            test_targets: targets.select(Axis(0), &indices.test),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(counts: &[usize]) -> Vec<usize> {
        counts
            .iter()
            .enumerate()
            .flat_map(|(class, &n)| std::iter::repeat(class).take(n))
            .collect()
    }

    fn count(classes: &[usize], indices: &[usize], class: usize) -> usize {
        indices.iter().filter(|&&i| classes[i] == class).count()
    }

    #[test]
    fn same_seed_gives_same_split() {
        let classes = labels(&[37, 23]);
        let config = SplitConfig::new();

        let first = stratified_split(&classes, &config).unwrap();
        let second = stratified_split(&classes, &config).unwrap();
        assert_eq!(first, second);

        let other = stratified_split(&classes, &config.clone().with_seed(7)).unwrap();
        assert_ne!(first, other);
    }

    #[test]
    fn partition_covers_every_sample_once() {
        let classes = labels(&[11, 9, 5]);
        let split = stratified_split(&classes, &SplitConfig::new()).unwrap();

        let mut all: Vec<usize> = split.train.iter().chain(&split.test).copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..classes.len()).collect::<Vec<_>>());
        assert_eq!(split.test.len(), 5);
    }

    #[test]
    fn class_proportions_are_preserved() {
        let classes = labels(&[300, 100]);
        let split = stratified_split(&classes, &SplitConfig::new()).unwrap();

        for part in [&split.train, &split.test] {
            let share = count(&classes, part, 0) as f64 / part.len() as f64;
            assert!((share - 0.75).abs() <= 1.0 / part.len() as f64);
        }
        assert_eq!(count(&classes, &split.test, 0), 60);
        assert_eq!(count(&classes, &split.test, 1), 20);
    }

    #[test]
    fn toy_dataset_splits_evenly() {
        let classes = labels(&[10, 10]);
        let split = stratified_split(&classes, &SplitConfig::new()).unwrap();
        assert_eq!(count(&classes, &split.test, 0), 2);
        assert_eq!(count(&classes, &split.test, 1), 2);
        assert_eq!(split.train.len(), 16);
    }

    #[test]
    fn singleton_class_is_rejected() {
        let classes = labels(&[10, 1]);
        assert!(matches!(
            stratified_split(&classes, &SplitConfig::new()),
            Err(Error::Split(_))
        ));
    }

    #[test]
    fn fraction_outside_unit_interval_is_rejected() {
        let classes = labels(&[10, 10]);
        let config = SplitConfig::new().with_test_fraction(1.0);
        assert!(matches!(stratified_split(&classes, &config), Err(Error::Config(_))));
    }
}
