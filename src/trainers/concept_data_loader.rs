//! Concept image folders
//!
//! Every concept contributes its instance images and, when prior preservation
//! is on, its class images. Prompts are indexed by condition id: the instance
//! prompt of concept `i` is `2 * i`, its class prompt `2 * i + 1`.

use anyhow::{bail, Context, Result};
use candle_core::{Device, Tensor};
use image::{imageops::FilterType, DynamicImage};
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};

use super::aspect_buckets::AspectBuckets;
use crate::config::{Concept, DataConfig};

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "webp", "bmp"];

/// One training image, `[3, H, W]` float32 in [-1, 1] on the CPU.
#[derive(Debug, Clone)]
pub struct ImageSample {
    pub pixels: Tensor,
    pub condition: usize,
    pub is_class: bool,
}

impl ImageSample {
    /// `(width, height)`
    pub fn size(&self) -> (usize, usize) {
        let dims = self.pixels.dims();
        (dims[2], dims[1])
    }
}

/// Decoded training images plus the prompts they are conditioned on.
#[derive(Debug, Clone, Default)]
pub struct ConceptDataset {
    prompts: Vec<String>,
    instance: Vec<ImageSample>,
    class: Vec<ImageSample>,
}

/// How loaded images are brought to their training size.
#[derive(Debug, Clone, Copy)]
pub struct ImageTransform<'a> {
    pub resolution: usize,
    pub center_crop: bool,
    pub buckets: Option<&'a AspectBuckets>,
}

impl<'a> ImageTransform<'a> {
    pub fn target_size(&self, width: usize, height: usize) -> (usize, usize) {
        match self.buckets {
            Some(buckets) => buckets.assign(width, height),
            None => (self.resolution, self.resolution),
        }
    }
}

struct LoadJob {
    path: PathBuf,
    condition: usize,
    is_class: bool,
}

impl ConceptDataset {
    pub fn new(prompts: Vec<String>, instance: Vec<ImageSample>, class: Vec<ImageSample>) -> Self {
        Self {
            prompts,
            instance,
            class,
        }
    }

    /// Load every concept folder. Class folders are read only with `load_class`.
    pub fn from_concepts(
        concepts: &[Concept],
        data: &DataConfig,
        buckets: Option<&AspectBuckets>,
        load_class: bool,
    ) -> Result<Self> {
        let transform = ImageTransform {
            resolution: data.resolution,
            center_crop: data.center_crop,
            buckets,
        };

        let mut prompts = Vec::with_capacity(concepts.len() * 2);
        let mut jobs = Vec::new();
        for (index, concept) in concepts.iter().enumerate() {
            let instance_files = list_images(&concept.instance_set.path)?;
            if instance_files.is_empty() {
                bail!(
                    "Concept {} has no images in {}",
                    index,
                    concept.instance_set.path.display()
                );
            }
            jobs.extend(instance_files.into_iter().map(|path| LoadJob {
                path,
                condition: 2 * index,
                is_class: false,
            }));
            prompts.push(concept.instance_set.prompt.clone());

            match (&concept.class_set, load_class) {
                (Some(class_set), true) => {
                    let class_files = list_images(&class_set.path)?;
                    if class_files.is_empty() {
                        bail!("Concept {} has no class images in {}", index, class_set.path.display());
                    }
                    jobs.extend(class_files.into_iter().map(|path| LoadJob {
                        path,
                        condition: 2 * index + 1,
                        is_class: true,
                    }));
                    prompts.push(class_set.prompt.clone());
                }
                (Some(class_set), false) => prompts.push(class_set.prompt.clone()),
                (None, _) => prompts.push(String::new()),
            }
        }

        let samples: Vec<ImageSample> = jobs
            .par_iter()
            .map(|job| {
                let pixels = load_image(&job.path, &transform)?;
                Ok(ImageSample {
                    pixels,
                    condition: job.condition,
                    is_class: job.is_class,
                })
            })
            .collect::<Result<_>>()?;

        let (class, instance): (Vec<_>, Vec<_>) = samples.into_iter().partition(|s| s.is_class);
        log::info!(
            "Loaded {} instance and {} class images from {} concepts",
            instance.len(),
            class.len(),
            concepts.len()
        );
        Ok(Self::new(prompts, instance, class))
    }

    pub fn prompts(&self) -> &[String] {
        &self.prompts
    }

    pub fn prompt(&self, condition: usize) -> &str {
        self.prompts.get(condition).map(String::as_str).unwrap_or("")
    }

    pub fn instance(&self) -> &[ImageSample] {
        &self.instance
    }

    pub fn class(&self) -> &[ImageSample] {
        &self.class
    }

    /// Conditions that instance images use, in ascending order.
    pub fn instance_conditions(&self) -> Vec<usize> {
        let mut conditions: Vec<usize> = self.instance.iter().map(|s| s.condition).collect();
        conditions.sort_unstable();
        conditions.dedup();
        conditions
    }

    /// Class image paired with instance image `index` during `epoch`:
    /// the class pool of the same concept, cycled.
    pub fn paired_class(&self, index: usize, epoch: usize) -> Option<usize> {
        let condition = self.instance.get(index)?.condition + 1;
        let pool: Vec<usize> = self
            .class
            .iter()
            .enumerate()
            .filter(|(_, s)| s.condition == condition)
            .map(|(i, _)| i)
            .collect();
        if pool.is_empty() {
            return None;
        }
        Some(pool[(index + epoch) % pool.len()])
    }

    /// `(width, height)` of every instance image.
    pub fn instance_sizes(&self) -> Vec<(usize, usize)> {
        self.instance.iter().map(ImageSample::size).collect()
    }
}

/// Image files directly inside `dir`, sorted by name.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to read image directory: {}", dir.display()))?;

    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let is_image = path
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .map(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
            .unwrap_or(false);
        if is_image && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Decode, resize and normalize one image.
pub fn load_image(path: &Path, transform: &ImageTransform<'_>) -> Result<Tensor> {
    let img = image::open(path).with_context(|| format!("Failed to open image: {}", path.display()))?;
    let (width, height) = transform.target_size(img.width() as usize, img.height() as usize);
    let img = prepare_image(img, width, height, transform.center_crop);
    image_to_tensor(&img)
}

/// Resize to cover `width x height` and center-crop, or stretch when cropping is off.
pub fn prepare_image(img: DynamicImage, width: usize, height: usize, center_crop: bool) -> DynamicImage {
    let (target_w, target_h) = (width as u32, height as u32);
    if !center_crop {
        return img.resize_exact(target_w, target_h, FilterType::Lanczos3);
    }

    let scale = (target_w as f32 / img.width() as f32).max(target_h as f32 / img.height() as f32);
    let new_w = ((img.width() as f32 * scale).round() as u32).max(target_w);
    let new_h = ((img.height() as f32 * scale).round() as u32).max(target_h);
    let resized = img.resize_exact(new_w, new_h, FilterType::Lanczos3);

    let crop_x = (new_w - target_w) / 2;
    let crop_y = (new_h - target_h) / 2;
    resized.crop_imm(crop_x, crop_y, target_w, target_h)
}

/// RGB image to a `[3, H, W]` tensor in [-1, 1].
pub fn image_to_tensor(img: &DynamicImage) -> Result<Tensor> {
    let rgb = img.to_rgb8();
    let (width, height) = (rgb.width() as usize, rgb.height() as usize);
    let data = rgb.into_raw();

    let tensor = Tensor::from_vec(data, (height, width, 3), &Device::Cpu)?
        .permute((2, 0, 1))?
        .to_dtype(candle_core::DType::F32)?;
    Ok(((tensor / 127.5)? - 1.0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImageSet;
    use image::{ImageBuffer, Rgb};

    fn write_png(path: &Path, width: u32, height: u32, color: [u8; 3]) {
        let img = ImageBuffer::from_pixel(width, height, Rgb(color));
        img.save(path).unwrap();
    }

    fn data_config(resolution: usize) -> DataConfig {
        DataConfig {
            resolution,
            batch_size: 1,
            center_crop: true,
            cache: None,
            concepts: Vec::new(),
        }
    }

    #[test]
    fn test_list_images_filters_extensions() {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("b.png"), 4, 4, [0, 0, 0]);
        write_png(&dir.path().join("a.PNG"), 4, 4, [0, 0, 0]);
        fs::write(dir.path().join("caption.txt"), "a dog").unwrap();

        let files = list_images(dir.path()).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("a.PNG"));
    }

    #[test]
    fn test_prepare_image_covers_and_crops() {
        let img = DynamicImage::ImageRgb8(ImageBuffer::from_pixel(40, 20, Rgb([10, 20, 30])));
        let out = prepare_image(img, 16, 16, true);
        assert_eq!((out.width(), out.height()), (16, 16));
    }

    #[test]
    fn test_image_to_tensor_range() -> Result<()> {
        let img = DynamicImage::ImageRgb8(ImageBuffer::from_pixel(2, 3, Rgb([255, 0, 255])));
        let tensor = image_to_tensor(&img)?;
        assert_eq!(tensor.dims(), &[3, 3, 2]);
        let red = tensor.get(0)?.flatten_all()?.to_vec1::<f32>()?;
        let green = tensor.get(1)?.flatten_all()?.to_vec1::<f32>()?;
        assert!(red.iter().all(|&v| (v - 1.0).abs() < 1e-6));
        assert!(green.iter().all(|&v| (v + 1.0).abs() < 1e-6));
        Ok(())
    }

    #[test]
    fn test_from_concepts_assigns_conditions_and_pairs_classes() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let inst = dir.path().join("inst");
        let class = dir.path().join("class");
        fs::create_dir_all(&inst)?;
        fs::create_dir_all(&class)?;
        write_png(&inst.join("0.png"), 12, 8, [200, 0, 0]);
        write_png(&inst.join("1.png"), 8, 8, [0, 200, 0]);
        write_png(&class.join("0.png"), 8, 8, [0, 0, 200]);

        let concepts = vec![Concept {
            instance_set: ImageSet { path: inst, prompt: "a sks dog".to_string() },
            class_set: Some(ImageSet { path: class, prompt: "a dog".to_string() }),
        }];

        let dataset = ConceptDataset::from_concepts(&concepts, &data_config(8), None, true)?;
        assert_eq!(dataset.instance().len(), 2);
        assert_eq!(dataset.class().len(), 1);
        assert_eq!(dataset.prompt(0), "a sks dog");
        assert_eq!(dataset.prompt(1), "a dog");
        assert_eq!(dataset.instance_sizes(), vec![(8, 8), (8, 8)]);
        assert_eq!(dataset.paired_class(1, 3), Some(0));

        let without_class = ConceptDataset::from_concepts(&concepts, &data_config(8), None, false)?;
        assert!(without_class.class().is_empty());
        assert_eq!(without_class.paired_class(0, 0), None);
        Ok(())
    }

    #[test]
    fn test_empty_concept_folder_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let concepts = vec![Concept {
            instance_set: ImageSet { path: dir.path().to_path_buf(), prompt: "x".to_string() },
            class_set: None,
        }];
        assert!(ConceptDataset::from_concepts(&concepts, &data_config(8), None, false).is_err());
    }
}
