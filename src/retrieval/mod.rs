//! 工具相关性两级检索
//!
//! 一级粗排：目标与各工具相关性文本做嵌入（按文本哈希缓存），余弦相似度降序，
//! 同分按目录顺序稳定排序，截断到 candidate_k；
//! 二级精排（可选）：交给 Rerank 提供方重排，截断到 top_n。
//! 精排任何失败都降级为粗排结果并打上 degraded 标记，对调用方永不致命。

pub mod rerank;

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::config::RetrievalSection;
use crate::llm::EmbeddingProvider;
use crate::tools::ToolDescriptor;

pub use rerank::{HttpReranker, RerankProvider};

/// 一条排名结果
#[derive(Debug, Clone)]
pub struct RankedTool {
    pub descriptor: ToolDescriptor,
    pub coarse_score: f32,
    pub fine_score: Option<f32>,
}

/// 检索结果：有序工具清单；precise 失败时 degraded 记录原因
#[derive(Debug, Clone)]
pub struct Ranking {
    pub tools: Vec<RankedTool>,
    /// Some(原因) 表示精排（或嵌入）降级，结果来自前一级
    pub degraded: Option<String>,
}

impl Ranking {
    pub fn names(&self) -> Vec<String> {
        self.tools
            .iter()
            .map(|t| t.descriptor.name.clone())
            .collect()
    }
}

/// 两级检索管线
pub struct RetrievalPipeline {
    embedder: Arc<dyn EmbeddingProvider>,
    reranker: Option<Arc<dyn RerankProvider>>,
    cfg: RetrievalSection,
    /// 嵌入缓存：文本哈希 -> 向量（读多写少）
    cache: RwLock<HashMap<u64, Arc<Vec<f32>>>>,
}

impl RetrievalPipeline {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, cfg: RetrievalSection) -> Self {
        Self {
            embedder,
            reranker: None,
            cfg,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn RerankProvider>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    /// 对目录做两级排序。空目标返回目录原序；空目录返回空表。
    pub async fn rank(&self, objective: &str, catalog: &[ToolDescriptor]) -> Ranking {
        if catalog.is_empty() {
            return Ranking {
                tools: vec![],
                degraded: None,
            };
        }
        if objective.trim().is_empty() {
            // 目标为空：目录原样返回，不排序、不截断
            return Ranking {
                tools: catalog
                    .iter()
                    .map(|d| RankedTool {
                        descriptor: d.clone(),
                        coarse_score: 0.0,
                        fine_score: None,
                    })
                    .collect(),
                degraded: None,
            };
        }

        let coarse = match self.coarse_rank(objective, catalog).await {
            Ok(ranked) => ranked,
            Err(reason) => {
                // 嵌入失败：目录原序截断，打降级标记
                tracing::warn!(reason = %reason, "coarse ranking degraded to catalog order");
                let mut tools: Vec<RankedTool> = catalog
                    .iter()
                    .map(|d| RankedTool {
                        descriptor: d.clone(),
                        coarse_score: 0.0,
                        fine_score: None,
                    })
                    .collect();
                truncate(&mut tools, self.cfg.candidate_k);
                return Ranking {
                    tools,
                    degraded: Some(reason),
                };
            }
        };

        if !self.cfg.enable_rerank || coarse.len() <= 1 {
            return Ranking {
                tools: coarse,
                degraded: None,
            };
        }
        let Some(reranker) = &self.reranker else {
            return Ranking {
                tools: coarse,
                degraded: None,
            };
        };

        match self.fine_rank(reranker.as_ref(), objective, &coarse).await {
            Ok(tools) => Ranking {
                tools,
                degraded: None,
            },
            Err(reason) => {
                tracing::warn!(reason = %reason, "rerank failed, falling back to coarse order");
                Ranking {
                    tools: coarse,
                    degraded: Some(reason),
                }
            }
        }
    }

    /// 一级粗排：嵌入 + 余弦相似度，稳定排序后截断
    async fn coarse_rank(
        &self,
        objective: &str,
        catalog: &[ToolDescriptor],
    ) -> Result<Vec<RankedTool>, String> {
        let mut texts = vec![objective.to_string()];
        texts.extend(catalog.iter().map(|d| d.relevance_text.clone()));
        let vectors = self.embed_cached(&texts).await?;

        let objective_vec = &vectors[0];
        let mut ranked: Vec<RankedTool> = catalog
            .iter()
            .enumerate()
            .map(|(i, d)| RankedTool {
                descriptor: d.clone(),
                coarse_score: cosine_similarity(objective_vec, &vectors[i + 1]),
                fine_score: None,
            })
            .collect();

        // sort_by 稳定：同分保持目录顺序
        ranked.sort_by(|a, b| {
            b.coarse_score
                .partial_cmp(&a.coarse_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        truncate(&mut ranked, self.cfg.candidate_k);
        Ok(ranked)
    }

    /// 二级精排：按提供方返回的分数重排并截断到 top_n
    async fn fine_rank(
        &self,
        reranker: &dyn RerankProvider,
        objective: &str,
        coarse: &[RankedTool],
    ) -> Result<Vec<RankedTool>, String> {
        let documents: Vec<String> = coarse
            .iter()
            .map(|t| t.descriptor.relevance_text.clone())
            .collect();
        let top_n = if self.cfg.top_n <= 0 {
            documents.len()
        } else {
            (self.cfg.top_n as usize).min(documents.len())
        };

        let scored = reranker.rerank(objective, &documents, top_n).await?;

        let mut tools = Vec::with_capacity(top_n);
        for (index, score) in scored {
            let Some(tool) = coarse.get(index) else {
                continue; // 提供方返回了越界下标，忽略
            };
            tools.push(RankedTool {
                descriptor: tool.descriptor.clone(),
                coarse_score: tool.coarse_score,
                fine_score: Some(score),
            });
            if tools.len() >= top_n {
                break;
            }
        }
        if tools.is_empty() {
            return Err("rerank returned no usable entries".to_string());
        }
        Ok(tools)
    }

    /// 批量嵌入，命中缓存的文本不再请求
    async fn embed_cached(&self, texts: &[String]) -> Result<Vec<Arc<Vec<f32>>>, String> {
        let keys: Vec<u64> = texts.iter().map(|t| text_hash(t)).collect();

        let mut out: Vec<Option<Arc<Vec<f32>>>> = vec![None; texts.len()];
        let mut missing: Vec<usize> = Vec::new();
        {
            let cache = self.cache.read().await;
            for (i, key) in keys.iter().enumerate() {
                match cache.get(key) {
                    Some(v) => out[i] = Some(v.clone()),
                    None => missing.push(i),
                }
            }
        }

        if !missing.is_empty() {
            let batch: Vec<String> = missing.iter().map(|&i| texts[i].clone()).collect();
            let vectors = self.embedder.embed(&batch).await?;
            if vectors.len() != batch.len() {
                return Err("embedding provider returned wrong count".to_string());
            }
            let mut cache = self.cache.write().await;
            for (slot, vector) in missing.iter().zip(vectors) {
                let v = Arc::new(vector);
                cache.insert(keys[*slot], v.clone());
                out[*slot] = Some(v);
            }
        }

        Ok(out.into_iter().map(|v| v.unwrap_or_default()).collect())
    }

    /// 当前缓存条数（测试用）
    pub async fn cache_len(&self) -> usize {
        self.cache.read().await.len()
    }
}

fn truncate(tools: &mut Vec<RankedTool>, limit: i64) {
    if limit > 0 && tools.len() > limit as usize {
        tools.truncate(limit as usize);
    }
}

fn text_hash(text: &str) -> u64 {
    let mut h = DefaultHasher::new();
    text.hash(&mut h);
    h.finish()
}

/// 余弦相似度
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    /// 固定向量嵌入：按关键词返回正交向量，便于构造确定的相似度
    struct FixtureEmbedder;

    #[async_trait]
    impl EmbeddingProvider for FixtureEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, String> {
            Ok(texts
                .iter()
                .map(|t| {
                    if t.contains("weather") {
                        vec![1.0, 0.0, 0.0]
                    } else if t.contains("file") {
                        vec![0.0, 1.0, 0.0]
                    } else {
                        vec![0.0, 0.0, 1.0]
                    }
                })
                .collect())
        }
    }

    struct FailingEmbedder;

    #[async_trait]
    impl EmbeddingProvider for FailingEmbedder {
        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, String> {
            Err("embedding service down".to_string())
        }
    }

    struct FailingReranker;

    #[async_trait]
    impl RerankProvider for FailingReranker {
        async fn rerank(
            &self,
            _query: &str,
            _documents: &[String],
            _top_n: usize,
        ) -> Result<Vec<(usize, f32)>, String> {
            Err("rerank timeout".to_string())
        }
    }

    struct ReverseReranker;

    #[async_trait]
    impl RerankProvider for ReverseReranker {
        async fn rerank(
            &self,
            _query: &str,
            documents: &[String],
            top_n: usize,
        ) -> Result<Vec<(usize, f32)>, String> {
            Ok((0..documents.len())
                .rev()
                .take(top_n)
                .enumerate()
                .map(|(rank, idx)| (idx, 1.0 - rank as f32 * 0.1))
                .collect())
        }
    }

    fn descriptor(name: &str, relevance: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: name.to_string(),
            input_schema: json!({"type": "object", "properties": {}, "required": []}),
            relevance_text: relevance.to_string(),
            scope: "global".to_string(),
        }
    }

    fn catalog() -> Vec<ToolDescriptor> {
        vec![
            descriptor("file_read", "read a file from disk"),
            descriptor("weather_lookup", "look up current weather"),
            descriptor("clock", "tell the current time"),
        ]
    }

    #[tokio::test]
    async fn test_empty_objective_is_identity() {
        let pipeline =
            RetrievalPipeline::new(Arc::new(FixtureEmbedder), RetrievalSection::default());
        let ranking = pipeline.rank("", &catalog()).await;
        assert_eq!(ranking.names(), vec!["file_read", "weather_lookup", "clock"]);
        assert!(ranking.degraded.is_none());
    }

    #[tokio::test]
    async fn test_empty_catalog_returns_empty() {
        let pipeline =
            RetrievalPipeline::new(Arc::new(FixtureEmbedder), RetrievalSection::default());
        let ranking = pipeline.rank("anything", &[]).await;
        assert!(ranking.tools.is_empty());
    }

    #[tokio::test]
    async fn test_coarse_rank_orders_by_similarity() {
        let pipeline =
            RetrievalPipeline::new(Arc::new(FixtureEmbedder), RetrievalSection::default());
        let ranking = pipeline.rank("what is the weather in Berlin", &catalog()).await;
        assert_eq!(ranking.names()[0], "weather_lookup");
        assert!(ranking.degraded.is_none());
    }

    #[tokio::test]
    async fn test_candidate_k_truncates() {
        let cfg = RetrievalSection {
            candidate_k: 1,
            ..RetrievalSection::default()
        };
        let pipeline = RetrievalPipeline::new(Arc::new(FixtureEmbedder), cfg);
        let ranking = pipeline.rank("weather please", &catalog()).await;
        assert_eq!(ranking.tools.len(), 1);
        assert_eq!(ranking.names()[0], "weather_lookup");
    }

    #[tokio::test]
    async fn test_rerank_failure_degrades_to_coarse() {
        let cfg = RetrievalSection {
            enable_rerank: true,
            ..RetrievalSection::default()
        };
        let pipeline = RetrievalPipeline::new(Arc::new(FixtureEmbedder), cfg)
            .with_reranker(Arc::new(FailingReranker));
        let ranking = pipeline.rank("weather today", &catalog()).await;
        assert_eq!(ranking.names()[0], "weather_lookup");
        assert!(ranking.degraded.is_some());
    }

    #[tokio::test]
    async fn test_rerank_reorders_and_truncates() {
        let cfg = RetrievalSection {
            enable_rerank: true,
            top_n: 2,
            ..RetrievalSection::default()
        };
        let pipeline = RetrievalPipeline::new(Arc::new(FixtureEmbedder), cfg)
            .with_reranker(Arc::new(ReverseReranker));
        let ranking = pipeline.rank("weather today", &catalog()).await;
        assert_eq!(ranking.tools.len(), 2);
        assert!(ranking.tools.iter().all(|t| t.fine_score.is_some()));
        assert!(ranking.degraded.is_none());
    }

    #[tokio::test]
    async fn test_embedding_failure_degrades_to_catalog_order() {
        let pipeline =
            RetrievalPipeline::new(Arc::new(FailingEmbedder), RetrievalSection::default());
        let ranking = pipeline.rank("weather", &catalog()).await;
        assert_eq!(ranking.names(), vec!["file_read", "weather_lookup", "clock"]);
        assert!(ranking.degraded.is_some());
    }

    #[tokio::test]
    async fn test_embedding_cache_hits() {
        let pipeline =
            RetrievalPipeline::new(Arc::new(FixtureEmbedder), RetrievalSection::default());
        let _ = pipeline.rank("weather", &catalog()).await;
        let n = pipeline.cache_len().await;
        let _ = pipeline.rank("weather", &catalog()).await;
        // 第二次全部命中缓存，条数不变
        assert_eq!(pipeline.cache_len().await, n);
    }
}
