//! List generator: one parameter set per inline element

use async_trait::async_trait;

use super::{append_values, Generator, Params};
use crate::crd::{ApplicationSet, GeneratorKind, GeneratorSpec};
use crate::Error;

/// Emits `cluster`, `url` and `values.<key>` for every list element
#[derive(Clone, Debug, Default)]
pub struct ListParamsGenerator;

impl ListParamsGenerator {
    /// Create a list generator
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Generator for ListParamsGenerator {
    async fn generate_params(
        &self,
        spec: &GeneratorSpec,
        _owner: &ApplicationSet,
    ) -> Result<Option<Vec<Params>>, Error> {
        let GeneratorKind::List(list) = spec.kind()? else {
            return Ok(None);
        };

        let params = list
            .elements
            .iter()
            .map(|element| {
                let mut params = Params::new();
                params.insert("cluster".to_string(), element.cluster.clone());
                params.insert("url".to_string(), element.url.clone());
                append_values(&mut params, &element.values);
                params
            })
            .collect();

        Ok(Some(params))
    }
}
