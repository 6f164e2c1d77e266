//! # Storybook Assembly
//!
//! Builds a personalised storybook from a theme: substitutes the child's
//! profile into each scene's text and image prompt, runs the illustration
//! pipeline once per scene, and hands the finished pages to a PDF renderer.
//!
//! A storybook is all or nothing. The first scene whose illustration does not
//! succeed aborts the whole book with that scene's error.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use lazy_static::lazy_static;
use rand::seq::SliceRandom;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::illustration_model::{GenerationRequest, ProviderKind};
use crate::pipeline::IllustrationPipeline;

/// Appended to every scene prompt
pub const STYLE_SUFFIX: &str = ", high quality, detailed, professional children's book illustration, vibrant colors, Pixar animation style";
pub const DEFAULT_SHIRT_COLOR: &str = "rainbow-striped";
pub const MAX_NAME_LENGTH: usize = 50;

lazy_static! {
    static ref PLACEHOLDER_REGEX: Regex =
        Regex::new(r"\{(\w+)\}").expect("Placeholder pattern should be valid");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Boy,
    Girl,
}

impl Gender {
    pub fn as_str(self) -> &'static str {
        match self {
            Gender::Boy => "boy",
            Gender::Girl => "girl",
        }
    }
}

impl FromStr for Gender {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "boy" | "male" => Ok(Gender::Boy),
            "girl" | "female" => Ok(Gender::Girl),
            other => Err(format!("unknown gender: {other}")),
        }
    }
}

/// The child a storybook is written for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildProfile {
    pub name: String,
    pub age: u8,
    pub gender: Gender,
    pub theme_id: String,
}

/// Validates a child name input
pub fn validate_child_name(name: &str) -> Result<String, &'static str> {
    let trimmed = name.trim();

    if trimmed.is_empty() {
        return Err("empty");
    }

    if trimmed.chars().count() > MAX_NAME_LENGTH {
        return Err("too_long");
    }

    if trimmed
        .chars()
        .any(|c| c == '/' || c == '\\' || c.is_control())
        || trimmed.contains("..")
    {
        return Err("invalid_characters");
    }

    Ok(trimmed.to_string())
}

/// File name for a child's finished book. Letters and digits are kept, every
/// other character becomes `_`, so the result never leaves `output_dir`.
pub fn pdf_file_name(child: &ChildProfile) -> String {
    let stem = |text: &str| -> String {
        text.chars()
            .map(|c| if c.is_alphanumeric() { c } else { '_' })
            .collect()
    };
    format!("{}_{}.pdf", stem(&child.name), stem(&child.theme_id))
}

/// Parses a child age input, accepting 1 to 12 years
pub fn parse_child_age(input: &str) -> Result<u8, &'static str> {
    let age: u8 = input.trim().parse().map_err(|_| "not_a_number")?;
    if !(1..=12).contains(&age) {
        return Err("out_of_range");
    }
    Ok(age)
}

/// Appearance attributes a vision model extracted from the child's photo
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoAnalysis {
    pub hair_color: String,
    #[serde(default)]
    pub eye_color: String,
    #[serde(default)]
    pub features: Vec<String>,
}

impl PhotoAnalysis {
    /// Parse the model's JSON reply, tolerating a fenced ```json block
    pub fn from_model_reply(reply: &str) -> Result<Self> {
        let mut text = reply.trim();
        if let Some(fenced) = text.split("```").nth(1) {
            text = fenced.strip_prefix("json").unwrap_or(fenced).trim();
        }
        serde_json::from_str(text).with_context(|| {
            format!("Vision reply is not a valid analysis: {}", reply.trim())
        })
    }
}

/// Vision model that describes the child's photo
#[async_trait]
pub trait VisionAnalyzer: Send + Sync {
    async fn analyze(&self, photo: &[u8]) -> Result<PhotoAnalysis>;
}

/// Prompt fragments describing how the child looks
#[derive(Debug, Clone, PartialEq)]
pub struct Appearance {
    /// e.g. "brown-haired"
    pub hair_color: String,
    /// Appended to image prompts, e.g. ", with freckles"
    pub features: String,
}

impl Appearance {
    /// Typical look used when no photo was analysed
    pub fn default_for(gender: Gender) -> Self {
        let hair_color = match gender {
            Gender::Boy => "brown-haired",
            Gender::Girl => "blonde",
        };
        Self {
            hair_color: hair_color.to_string(),
            features: String::new(),
        }
    }

    pub fn from_analysis(analysis: &PhotoAnalysis, gender: Gender) -> Self {
        let hair = analysis.hair_color.trim();
        let hair_color = if hair.is_empty() || hair.eq_ignore_ascii_case("unknown") {
            Self::default_for(gender).hair_color
        } else {
            format!("{hair}-haired")
        };

        let has = |feature: &str| {
            analysis
                .features
                .iter()
                .any(|f| f.eq_ignore_ascii_case(feature))
        };
        let mut features = String::new();
        if has("freckles") {
            features.push_str(", with freckles");
        }
        if has("glasses") {
            features.push_str(", wearing glasses");
        }

        Self {
            hair_color,
            features,
        }
    }
}

/// Placeholder values substituted into scene text and prompts
pub fn template_vars(child: &ChildProfile, appearance: &Appearance) -> HashMap<&'static str, String> {
    let (he_she, his_her, him_her) = match child.gender {
        Gender::Boy => ("he", "his", "him"),
        Gender::Girl => ("she", "her", "her"),
    };
    let capitalized = |word: &str| {
        let mut chars = word.chars();
        chars
            .next()
            .map(|first| first.to_uppercase().chain(chars).collect::<String>())
            .unwrap_or_default()
    };

    HashMap::from([
        ("name", child.name.clone()),
        // Declined forms are only meaningful for inflected languages
        ("name_acc", child.name.clone()),
        ("name_dat", child.name.clone()),
        ("name_gen", child.name.clone()),
        ("age", child.age.to_string()),
        ("gender", child.gender.as_str().to_string()),
        ("hair_color", appearance.hair_color.clone()),
        ("shirt_color", DEFAULT_SHIRT_COLOR.to_string()),
        ("he_she", he_she.to_string()),
        ("He_She", capitalized(he_she)),
        ("his_her", his_her.to_string()),
        ("him_her", him_her.to_string()),
    ])
}

/// Replace `{var}` placeholders; unknown placeholders are left as they are
pub fn render_template(template: &str, vars: &HashMap<&'static str, String>) -> String {
    PLACEHOLDER_REGEX
        .replace_all(template, |caps: &Captures| {
            vars.get(&caps[1])
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    pub number: u32,
    #[serde(default)]
    pub title: Option<String>,
    pub text: String,
    pub image_prompt: String,
}

impl Scene {
    /// Full illustration prompt for this scene
    pub fn prompt(&self, vars: &HashMap<&'static str, String>, appearance: &Appearance) -> String {
        let mut prompt = render_template(
            &format!("{}{}", self.image_prompt, appearance.features),
            vars,
        );
        prompt.push_str(STYLE_SUFFIX);
        prompt
    }

    pub fn display_title(&self) -> String {
        self.title
            .clone()
            .unwrap_or_else(|| format!("Scene {}", self.number))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Story {
    #[serde(default)]
    pub id: Option<String>,
    pub title: String,
    pub scenes: Vec<Scene>,
}

/// A theme either offers several stories or exactly one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ThemeStories {
    Collection { stories: Vec<Story> },
    Single(Story),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Theme {
    pub name: String,
    /// Cover text, may contain line breaks
    #[serde(default)]
    pub cover_title: Option<String>,
    pub story: ThemeStories,
}

impl Theme {
    pub fn cover_title(&self) -> String {
        self.cover_title
            .clone()
            .unwrap_or_else(|| self.name.to_uppercase())
    }
}

/// All themes keyed by id, as stored in the themes JSON file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThemeCatalog {
    themes: HashMap<String, Theme>,
}

impl ThemeCatalog {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse theme catalog")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read theme catalog {}", path.display()))?;
        Self::from_json(&json)
    }

    pub fn theme(&self, theme_id: &str) -> Option<&Theme> {
        self.themes.get(theme_id)
    }

    /// Pick the story to tell: a specific id, or a random one from the theme
    pub fn select_story(&self, theme_id: &str, story_id: Option<&str>) -> Result<(&Theme, &Story)> {
        let theme = self
            .theme(theme_id)
            .with_context(|| format!("Theme '{theme_id}' not found"))?;

        let story = match (&theme.story, story_id) {
            (ThemeStories::Single(story), _) => story,
            (ThemeStories::Collection { stories }, Some(id)) => stories
                .iter()
                .find(|story| story.id.as_deref() == Some(id))
                .with_context(|| format!("Story '{id}' not found in theme '{theme_id}'"))?,
            (ThemeStories::Collection { stories }, None) => stories
                .choose(&mut rand::thread_rng())
                .with_context(|| format!("Theme '{theme_id}' has no stories"))?,
        };

        if story.scenes.is_empty() {
            bail!("Story '{}' has no scenes", story.title);
        }
        Ok((theme, story))
    }
}

/// One rendered page: illustration plus narrative text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageRecord {
    pub number: u32,
    pub title: String,
    pub text: String,
    pub image: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderJob {
    pub child: ChildProfile,
    pub cover_title: String,
    pub pages: Vec<PageRecord>,
    pub output_path: PathBuf,
}

/// Lays out finished pages into a PDF
#[async_trait]
pub trait PdfRenderer: Send + Sync {
    async fn render(&self, job: &RenderJob) -> Result<()>;
}

/// Per-item prices used for the cost estimate
#[derive(Debug, Clone, PartialEq)]
pub struct CostTable {
    pub primary_image: f64,
    pub fallback_image: f64,
    pub photo_analysis: f64,
}

impl Default for CostTable {
    fn default() -> Self {
        Self {
            primary_image: 15.0,
            fallback_image: 1.1,
            photo_analysis: 5.0,
        }
    }
}

/// Which provider produced each scene of a book
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderUsage {
    pub primary: u32,
    pub fallback: u32,
    pub photo_analyzed: bool,
}

impl ProviderUsage {
    pub fn record(&mut self, provider: ProviderKind) {
        match provider {
            ProviderKind::Primary => self.primary += 1,
            ProviderKind::Fallback => self.fallback += 1,
        }
    }

    pub fn total(&self) -> u32 {
        self.primary + self.fallback
    }

    pub fn estimated_cost(&self, costs: &CostTable) -> f64 {
        let analysis = if self.photo_analyzed {
            costs.photo_analysis
        } else {
            0.0
        };
        f64::from(self.primary) * costs.primary_image
            + f64::from(self.fallback) * costs.fallback_image
            + analysis
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StorybookResult {
    pub story_title: String,
    pub pages: Vec<PageRecord>,
    pub usage: ProviderUsage,
    pub pdf_path: PathBuf,
}

/// Drives the pipeline over every scene of a story
pub struct StorybookGenerator {
    pipeline: Arc<IllustrationPipeline>,
    renderer: Arc<dyn PdfRenderer>,
    analyzer: Option<Arc<dyn VisionAnalyzer>>,
}

impl StorybookGenerator {
    pub fn new(pipeline: Arc<IllustrationPipeline>, renderer: Arc<dyn PdfRenderer>) -> Self {
        Self {
            pipeline,
            renderer,
            analyzer: None,
        }
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn VisionAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    /// Generate every illustration and render the book
    ///
    /// # Errors
    ///
    /// Fails on an unknown theme or story, a failed photo analysis, the first
    /// scene whose illustration does not succeed, or a render failure.
    pub async fn generate(
        &self,
        child: &ChildProfile,
        catalog: &ThemeCatalog,
        story_id: Option<&str>,
        photo: Option<&[u8]>,
        output_dir: &Path,
    ) -> Result<StorybookResult> {
        if let Err(code) = validate_child_name(&child.name) {
            bail!("Invalid child name '{}': {code}", child.name);
        }
        let (theme, story) = catalog.select_story(&child.theme_id, story_id)?;
        info!(
            child = %child.name,
            theme = %child.theme_id,
            story = %story.title,
            scenes = story.scenes.len(),
            "Creating storybook"
        );

        let mut usage = ProviderUsage::default();
        let appearance = match (photo, &self.analyzer) {
            (Some(photo), Some(analyzer)) => {
                let analysis = analyzer
                    .analyze(photo)
                    .await
                    .context("Photo analysis failed")?;
                usage.photo_analyzed = true;
                debug!(hair = %analysis.hair_color, eyes = %analysis.eye_color, "Photo analysed");
                Appearance::from_analysis(&analysis, child.gender)
            }
            _ => Appearance::default_for(child.gender),
        };
        let vars = template_vars(child, &appearance);

        tokio::fs::create_dir_all(output_dir)
            .await
            .with_context(|| format!("Failed to create output directory {}", output_dir.display()))?;

        let aspect_ratio = self.pipeline.config().default_aspect_ratio;
        let mut pages = Vec::with_capacity(story.scenes.len());

        for scene in &story.scenes {
            let target = output_dir.join(format!("scene_{:02}.png", scene.number));
            let mut request = GenerationRequest::new(scene.prompt(&vars, &appearance), target)
                .with_aspect_ratio(aspect_ratio);
            if let Some(photo) = photo {
                request = request.with_reference_photo(photo.to_vec());
            }

            info!(scene = scene.number, title = %scene.display_title(), "Illustrating scene");
            let (image, provider) = match self.pipeline.generate(&request).await.into_result() {
                Ok(generated) => generated,
                Err(err) => {
                    error!(scene = scene.number, error = %err, "Scene illustration failed, aborting storybook");
                    return Err(anyhow::Error::new(err).context(format!(
                        "Scene {} illustration failed; storybook for {} aborted",
                        scene.number, child.name
                    )));
                }
            };
            usage.record(provider);

            pages.push(PageRecord {
                number: scene.number,
                title: scene.display_title(),
                text: render_template(&scene.text, &vars),
                image: image.path,
            });
        }

        let pdf_path = output_dir.join(pdf_file_name(child));
        let job = RenderJob {
            child: child.clone(),
            cover_title: theme.cover_title(),
            pages,
            output_path: pdf_path.clone(),
        };
        self.renderer
            .render(&job)
            .await
            .context("Failed to render storybook PDF")?;

        info!(
            pdf = %pdf_path.display(),
            primary = usage.primary,
            fallback = usage.fallback,
            estimated_cost = usage.estimated_cost(&CostTable::default()),
            "Storybook ready"
        );

        Ok(StorybookResult {
            story_title: story.title.clone(),
            pages: job.pages,
            usage,
            pdf_path,
        })
    }
}
