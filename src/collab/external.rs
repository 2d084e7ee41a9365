//! [`Collaborators`] backed by an external tool executable.
//!
//! Each call runs `<program> <args...> <operation>` in its own process,
//! writes the JSON request to stdin and parses the JSON response from
//! stdout. The child is killed if the call is dropped (task timeout or
//! abort).

use anyhow::{Context, Result};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::*;
use crate::config::ToolsConfig;

#[derive(Debug, Clone)]
pub struct ExternalTools {
    program: String,
    args: Vec<String>,
}

#[derive(Serialize)]
struct BoundsRequest {
    cloud: PathBuf,
}

#[derive(Deserialize)]
struct MaskResponse {
    usable: bool,
}

#[derive(Deserialize)]
struct DisparityResponse {
    success: bool,
}

#[derive(Deserialize)]
struct BoundsResponse {
    bounds: Option<[f64; 4]>,
}

#[derive(Deserialize)]
struct MeanHeightsResponse {
    /// `null` entries stand for NaN
    means: Vec<Option<f64>>,
}

impl ExternalTools {
    pub fn new(config: &ToolsConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
        }
    }

    async fn invoke<Req, Resp>(&self, operation: &'static str, req: Req) -> Result<Resp>
    where
        Req: Serialize + Send,
        Resp: DeserializeOwned,
    {
        let payload = serde_json::to_vec(&req)?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(operation)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to execute {} {}", self.program, operation))?;

        // Feed stdin while draining stdout/stderr so neither side can fill
        // a pipe and stall the other.
        let stdin = child.stdin.take();
        let send = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&payload).await?;
                stdin.shutdown().await?;
            }
            Ok::<(), std::io::Error>(())
        };
        let (sent, output) = tokio::join!(send, child.wait_with_output());
        let output = output?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            anyhow::bail!(
                "{} {} failed ({}): {}",
                self.program,
                operation,
                output.status,
                stderr.trim()
            );
        }
        if let Err(e) = sent {
            anyhow::bail!(
                "{} {} did not read its request ({}): {}",
                self.program,
                operation,
                e,
                stderr.trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let body = if stdout.trim().is_empty() { "null" } else { stdout.trim() };
        serde_json::from_str(body)
            .with_context(|| format!("{} {}: invalid JSON response", self.program, operation))
    }

    async fn invoke_unit<Req>(&self, operation: &'static str, req: Req) -> Result<()>
    where
        Req: Serialize + Send,
    {
        let _: IgnoredAny = self.invoke(operation, req).await?;
        Ok(())
    }
}

impl Collaborators for ExternalTools {
    fn create_tile_mask(&self, req: MaskRequest) -> impl Future<Output = Result<bool>> + Send {
        async move {
            let resp: MaskResponse = self.invoke("create_tile_mask", req).await?;
            Ok(resp.usable)
        }
    }

    fn estimate_pointing_correction(
        &self,
        req: PointingRequest,
    ) -> impl Future<Output = Result<PointingEstimate>> + Send {
        self.invoke("estimate_pointing_correction", req)
    }

    fn rectify(&self, req: RectifyRequest) -> impl Future<Output = Result<Rectification>> + Send {
        self.invoke("rectify", req)
    }

    fn compute_disparity(
        &self,
        req: DisparityRequest,
    ) -> impl Future<Output = Result<bool>> + Send {
        async move {
            let resp: DisparityResponse = self.invoke("compute_disparity", req).await?;
            Ok(resp.success)
        }
    }

    fn disparity_to_height(
        &self,
        req: TriangulationRequest,
    ) -> impl Future<Output = Result<()>> + Send {
        self.invoke_unit("disparity_to_height", req)
    }

    fn disparity_to_cloud(
        &self,
        req: TriangulationRequest,
    ) -> impl Future<Output = Result<()>> + Send {
        self.invoke_unit("disparity_to_cloud", req)
    }

    fn local_mean_heights(
        &self,
        req: MeanHeightsRequest,
    ) -> impl Future<Output = Result<Vec<f64>>> + Send {
        async move {
            let resp: MeanHeightsResponse = self.invoke("local_mean_heights", req).await?;
            Ok(resp.means.into_iter().map(|m| m.unwrap_or(f64::NAN)).collect())
        }
    }

    fn fuse_heights(&self, req: FusionRequest) -> impl Future<Output = Result<()>> + Send {
        self.invoke_unit("fuse_heights", req)
    }

    fn heights_to_cloud(&self, req: CloudRequest) -> impl Future<Output = Result<()>> + Send {
        self.invoke_unit("heights_to_cloud", req)
    }

    fn point_cloud_bounds(
        &self,
        cloud: PathBuf,
    ) -> impl Future<Output = Result<Option<[f64; 4]>>> + Send {
        async move {
            let resp: BoundsResponse = self
                .invoke("point_cloud_bounds", BoundsRequest { cloud })
                .await?;
            Ok(resp.bounds)
        }
    }

    fn flatten_point_clouds(
        &self,
        req: FlattenRequest,
    ) -> impl Future<Output = Result<()>> + Send {
        self.invoke_unit("flatten_point_clouds", req)
    }

    fn fill_holes(&self, req: HoleFillRequest) -> impl Future<Output = Result<()>> + Send {
        self.invoke_unit("fill_holes", req)
    }

    fn merge_rasters(&self, req: MergeRequest) -> impl Future<Output = Result<()>> + Send {
        self.invoke_unit("merge_rasters", req)
    }
}
