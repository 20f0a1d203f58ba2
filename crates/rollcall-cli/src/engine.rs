use rollcall_core::{
    recognized_from_votes, CosineMatcher, EmbeddingProvider, Embedding, ExtractError, Extractor,
    Gallery, IdentityId, ImageInput, MatchError, MatchParams,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("extraction failed: {0}")]
    Extract(#[from] ExtractError),
    #[error("matching failed: {0}")]
    Match(#[from] MatchError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Outcome of one recognition request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recognition {
    pub recognized: BTreeSet<IdentityId>,
    pub votes: BTreeMap<IdentityId, usize>,
    /// Faces found across all submitted images.
    pub probes: usize,
}

/// Messages sent from async callers to the engine thread.
enum EngineRequest {
    ExtractSingle {
        image: ImageInput,
        reply: oneshot::Sender<Result<Option<Embedding>, EngineError>>,
    },
    Recognize {
        images: Vec<ImageInput>,
        gallery: Gallery,
        params: MatchParams,
        reply: oneshot::Sender<Result<Recognition, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, EngineError>>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Embedding of the selected face in `image`, `None` when faceless.
    pub async fn extract_single(&self, image: ImageInput) -> Result<Option<Embedding>, EngineError> {
        self.call(|reply| EngineRequest::ExtractSingle { image, reply }).await
    }

    /// Use every face in every image as a probe and decide who is present.
    pub async fn recognize(
        &self,
        images: Vec<ImageInput>,
        gallery: Gallery,
        params: MatchParams,
    ) -> Result<Recognition, EngineError> {
        self.call(|reply| EngineRequest::Recognize {
            images,
            gallery,
            params,
            reply,
        })
        .await
    }
}

/// Move the extractor onto a dedicated OS thread and return a handle.
///
/// The provider is loaded by the caller before this point, so model start-up
/// cost is paid once; every request after that is served by the same
/// instance, one at a time.
pub fn spawn_engine<P>(extractor: Extractor<P>) -> Result<EngineHandle, EngineError>
where
    P: EmbeddingProvider + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);
    let mut extractor = extractor;

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!(selection = %extractor.selection(), "engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::ExtractSingle { image, reply } => {
                        let result = extractor.extract_single(&image).map_err(EngineError::from);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Recognize {
                        images,
                        gallery,
                        params,
                        reply,
                    } => {
                        let result = run_recognize(&mut extractor, &images, &gallery, params);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx })
}

fn run_recognize<P: EmbeddingProvider>(
    extractor: &mut Extractor<P>,
    images: &[ImageInput],
    gallery: &Gallery,
    params: MatchParams,
) -> Result<Recognition, EngineError> {
    let mut probes = Vec::new();
    for (i, image) in images.iter().enumerate() {
        let faces = extractor.extract_all(image)?;
        if faces.is_empty() {
            tracing::debug!(image = i, "recognize: no face detected");
        }
        probes.extend(faces.into_iter().map(|f| f.embedding));
    }

    let votes = CosineMatcher::new(params).votes(&probes, gallery.entries())?;
    let recognized = recognized_from_votes(&votes, params.min_votes);

    tracing::info!(
        images = images.len(),
        probes = probes.len(),
        recognized = recognized.len(),
        "recognize: done"
    );

    Ok(Recognition {
        recognized,
        votes,
        probes: probes.len(),
    })
}
