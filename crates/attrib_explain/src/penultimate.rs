//! Penultimate layer lookup for class activation maps.

use attrib_core::{DifferentiableModel, LayerId, LayerSpec, Result, VisError};
use serde::{Deserialize, Serialize};

/// Identifies the layer a class activation map is computed at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayerHint {
    /// Position in the layer sequence; negative values count from the end.
    Index(isize),
    /// Layer name.
    Name(String),
    /// Layer identity.
    Id(LayerId),
}

impl From<isize> for LayerHint {
    fn from(index: isize) -> Self {
        Self::Index(index)
    }
}

impl From<i32> for LayerHint {
    fn from(index: i32) -> Self {
        Self::Index(index as isize)
    }
}

impl From<&str> for LayerHint {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for LayerHint {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl From<LayerId> for LayerHint {
    fn from(id: LayerId) -> Self {
        Self::Id(id)
    }
}

impl From<&LayerSpec> for LayerHint {
    fn from(layer: &LayerSpec) -> Self {
        Self::Id(layer.id)
    }
}

fn position(layers: &[LayerSpec], hint: &LayerHint) -> Result<usize> {
    match hint {
        LayerHint::Index(index) => {
            let len = layers.len() as isize;
            let resolved = if *index < 0 { len + index } else { *index };
            if (0..len).contains(&resolved) {
                Ok(resolved as usize)
            } else {
                Err(VisError::invalid(format!(
                    "layer index {index} is out of range for a model with {len} layers"
                )))
            }
        }
        LayerHint::Name(name) => layers
            .iter()
            .position(|l| &l.name == name)
            .ok_or_else(|| VisError::invalid(format!("no layer named `{name}`"))),
        LayerHint::Id(id) => layers
            .iter()
            .position(|l| l.id == *id)
            .ok_or_else(|| VisError::invalid(format!("no layer with id {}", id.0))),
    }
}

/// Resolve the layer to compute the map at.
///
/// Without a hint the last layer is used. A spatial layer is taken as is.
/// Otherwise, with `seek` set, the layers before it are searched backward
/// for the nearest spatial one.
///
/// # Errors
///
/// [`VisError::InvalidArgument`] for an unknown hint, for a non-spatial
/// layer when `seek` is off, and when no spatial layer precedes the hint.
pub fn locate<M: DifferentiableModel>(
    model: &M,
    hint: Option<&LayerHint>,
    seek: bool,
) -> Result<LayerSpec> {
    let mut layers = model.layers();
    let start = position(&layers, hint.unwrap_or(&LayerHint::Index(-1)))?;

    if layers[start].is_spatial() {
        return Ok(layers.swap_remove(start));
    }
    if !seek {
        return Err(VisError::invalid(format!(
            "layer `{}` has a non-spatial output; pass a spatial layer or enable seeking",
            layers[start].name
        )));
    }
    let found = layers[..start].iter().rposition(LayerSpec::is_spatial).ok_or_else(|| {
        VisError::invalid(format!(
            "unable to determine the penultimate spatial layer before `{}`",
            layers[start].name
        ))
    })?;
    tracing::debug!(
        hint = %layers[start].name,
        layer = %layers[found].name,
        "located penultimate spatial layer"
    );
    Ok(layers.swap_remove(found))
}

/// Locate the layer and build a model exposing its activation as an extra
/// last output.
///
/// The returned model is a separate object; the original is not changed.
pub fn augment<M: DifferentiableModel>(
    model: &M,
    hint: Option<&LayerHint>,
    seek: bool,
) -> Result<(M, LayerSpec)> {
    let layer = locate(model, hint, seek)?;
    let augmented = model.with_layer_output(layer.id)?;
    Ok((augmented, layer))
}
