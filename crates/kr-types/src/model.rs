//! Process model handed to the solver.
//!
//! Binding and transport arrays follow the steric mass action layout: index 0
//! holds the salt entry and index `i + 1` holds product component `i`.

use serde::{Deserialize, Serialize};

use crate::errors::{KrResult, LookupError};
use crate::path::{Addressable, FieldMut, FieldRef};
use crate::validation_error;

/// A product and its named components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub name: String,
    pub component_names: Vec<String>,
}

impl Product {
    pub fn new(name: impl Into<String>, component_names: Vec<String>) -> Self {
        Self {
            name: name.into(),
            component_names,
        }
    }

    pub fn num_components(&self) -> usize {
        self.component_names.len()
    }

    pub fn component_index(&self, component: &str) -> KrResult<usize> {
        self.component_names
            .iter()
            .position(|c| c == component)
            .ok_or_else(|| {
                LookupError::Component {
                    name: component.to_string(),
                }
                .into()
            })
    }
}

/// Steric mass action binding parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingModel {
    pub name: String,
    pub is_kinetic: bool,
    /// Ionic capacity.
    pub sma_lambda: f64,
    pub sma_ka: Vec<f64>,
    pub sma_kd: Vec<f64>,
    /// Characteristic charge.
    pub sma_nu: Vec<f64>,
    /// Steric factor.
    pub sma_sigma: Vec<f64>,
}

impl BindingModel {
    /// SMA model for `num_components` product components plus salt.
    pub fn steric_mass_action(num_components: usize) -> Self {
        let n = num_components + 1;
        let mut sma_ka = vec![1.0; n];
        let mut sma_nu = vec![5.0; n];
        let mut sma_sigma = vec![10.0; n];
        sma_ka[0] = 0.0;
        sma_nu[0] = 0.0;
        sma_sigma[0] = 0.0;
        Self {
            name: "SMA".to_string(),
            is_kinetic: false,
            sma_lambda: 700.0,
            sma_ka,
            sma_kd: vec![1000.0; n],
            sma_nu,
            sma_sigma,
        }
    }

    pub fn num_components(&self) -> usize {
        self.sma_ka.len().saturating_sub(1)
    }
}

impl Addressable for BindingModel {
    fn field(&self, name: &str) -> Option<FieldRef<'_>> {
        match name {
            "sma_lambda" => Some(FieldRef::Scalar(self.sma_lambda)),
            "sma_ka" => Some(FieldRef::Array(&self.sma_ka)),
            "sma_kd" => Some(FieldRef::Array(&self.sma_kd)),
            "sma_nu" => Some(FieldRef::Array(&self.sma_nu)),
            "sma_sigma" => Some(FieldRef::Array(&self.sma_sigma)),
            _ => None,
        }
    }

    fn field_mut(&mut self, name: &str) -> Option<FieldMut<'_>> {
        match name {
            "sma_lambda" => Some(FieldMut::Scalar(&mut self.sma_lambda)),
            "sma_ka" => Some(FieldMut::Array(&mut self.sma_ka)),
            "sma_kd" => Some(FieldMut::Array(&mut self.sma_kd)),
            "sma_nu" => Some(FieldMut::Array(&mut self.sma_nu)),
            "sma_sigma" => Some(FieldMut::Array(&mut self.sma_sigma)),
            _ => None,
        }
    }

    fn field_names(&self) -> &'static [&'static str] {
        &["sma_lambda", "sma_ka", "sma_kd", "sma_nu", "sma_sigma"]
    }
}

/// General rate transport parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportModel {
    pub column_porosity: f64,
    pub bead_porosity: f64,
    pub axial_dispersion: f64,
    pub film_mass_transfer: Vec<f64>,
    pub pore_diffusion: Vec<f64>,
    pub surface_diffusion: Vec<f64>,
}

impl TransportModel {
    pub fn general_rate(num_components: usize) -> Self {
        let n = num_components + 1;
        Self {
            column_porosity: 0.3,
            bead_porosity: 0.5,
            axial_dispersion: 6e-8,
            film_mass_transfer: vec![6.9e-6; n],
            pore_diffusion: vec![7e-10; n],
            surface_diffusion: vec![0.0; n],
        }
    }
}

impl Addressable for TransportModel {
    fn field(&self, name: &str) -> Option<FieldRef<'_>> {
        match name {
            "column_porosity" => Some(FieldRef::Scalar(self.column_porosity)),
            "bead_porosity" => Some(FieldRef::Scalar(self.bead_porosity)),
            "axial_dispersion" => Some(FieldRef::Scalar(self.axial_dispersion)),
            "film_mass_transfer" => Some(FieldRef::Array(&self.film_mass_transfer)),
            "pore_diffusion" => Some(FieldRef::Array(&self.pore_diffusion)),
            "surface_diffusion" => Some(FieldRef::Array(&self.surface_diffusion)),
            _ => None,
        }
    }

    fn field_mut(&mut self, name: &str) -> Option<FieldMut<'_>> {
        match name {
            "column_porosity" => Some(FieldMut::Scalar(&mut self.column_porosity)),
            "bead_porosity" => Some(FieldMut::Scalar(&mut self.bead_porosity)),
            "axial_dispersion" => Some(FieldMut::Scalar(&mut self.axial_dispersion)),
            "film_mass_transfer" => Some(FieldMut::Array(&mut self.film_mass_transfer)),
            "pore_diffusion" => Some(FieldMut::Array(&mut self.pore_diffusion)),
            "surface_diffusion" => Some(FieldMut::Array(&mut self.surface_diffusion)),
            _ => None,
        }
    }

    fn field_names(&self) -> &'static [&'static str] {
        &[
            "column_porosity",
            "bead_porosity",
            "axial_dispersion",
            "film_mass_transfer",
            "pore_diffusion",
            "surface_diffusion",
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    /// Bed height in cm.
    pub bed_height: f64,
    /// Inner diameter in cm.
    pub diameter: f64,
}

impl Addressable for Column {
    fn field(&self, name: &str) -> Option<FieldRef<'_>> {
        match name {
            "bed_height" => Some(FieldRef::Scalar(self.bed_height)),
            "diameter" => Some(FieldRef::Scalar(self.diameter)),
            _ => None,
        }
    }

    fn field_mut(&mut self, name: &str) -> Option<FieldMut<'_>> {
        match name {
            "bed_height" => Some(FieldMut::Scalar(&mut self.bed_height)),
            "diameter" => Some(FieldMut::Scalar(&mut self.diameter)),
            _ => None,
        }
    }

    fn field_names(&self) -> &'static [&'static str] {
        &["bed_height", "diameter"]
    }
}

/// One step of the chromatography method (load, wash, elution...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodStep {
    pub name: String,
    /// Linear flow rate in cm/hr.
    pub flow_rate: f64,
    /// Volume in column volumes.
    pub volume: f64,
    /// Salt concentration in mM at the start of the step.
    pub salt_concentration: f64,
}

impl Addressable for MethodStep {
    fn field(&self, name: &str) -> Option<FieldRef<'_>> {
        match name {
            "flow_rate" => Some(FieldRef::Scalar(self.flow_rate)),
            "volume" => Some(FieldRef::Scalar(self.volume)),
            "salt_concentration" => Some(FieldRef::Scalar(self.salt_concentration)),
            _ => None,
        }
    }

    fn field_mut(&mut self, name: &str) -> Option<FieldMut<'_>> {
        match name {
            "flow_rate" => Some(FieldMut::Scalar(&mut self.flow_rate)),
            "volume" => Some(FieldMut::Scalar(&mut self.volume)),
            "salt_concentration" => Some(FieldMut::Scalar(&mut self.salt_concentration)),
            _ => None,
        }
    }

    fn field_names(&self) -> &'static [&'static str] {
        &["flow_rate", "volume", "salt_concentration"]
    }
}

/// Pooling criteria, expressed as fractions of the peak maximum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionCriteria {
    pub start_collection_target: f64,
    pub stop_collection_target: f64,
}

impl Addressable for CollectionCriteria {
    fn field(&self, name: &str) -> Option<FieldRef<'_>> {
        match name {
            "start_collection_target" => Some(FieldRef::Scalar(self.start_collection_target)),
            "stop_collection_target" => Some(FieldRef::Scalar(self.stop_collection_target)),
            _ => None,
        }
    }

    fn field_mut(&mut self, name: &str) -> Option<FieldMut<'_>> {
        match name {
            "start_collection_target" => Some(FieldMut::Scalar(&mut self.start_collection_target)),
            "stop_collection_target" => Some(FieldMut::Scalar(&mut self.stop_collection_target)),
            _ => None,
        }
    }

    fn field_names(&self) -> &'static [&'static str] {
        &["start_collection_target", "stop_collection_target"]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Method {
    pub name: String,
    pub method_steps: Vec<MethodStep>,
    pub collection_criteria: Option<CollectionCriteria>,
}

impl Addressable for Method {
    fn field(&self, name: &str) -> Option<FieldRef<'_>> {
        match name {
            "method_steps" => Some(FieldRef::List(
                self.method_steps
                    .iter()
                    .map(|s| s as &dyn Addressable)
                    .collect(),
            )),
            "collection_criteria" => self
                .collection_criteria
                .as_ref()
                .map(|c| FieldRef::Node(c as &dyn Addressable)),
            _ => None,
        }
    }

    fn field_mut(&mut self, name: &str) -> Option<FieldMut<'_>> {
        match name {
            "method_steps" => Some(FieldMut::List(
                self.method_steps
                    .iter_mut()
                    .map(|s| s as &mut dyn Addressable)
                    .collect(),
            )),
            "collection_criteria" => self
                .collection_criteria
                .as_mut()
                .map(|c| FieldMut::Node(c as &mut dyn Addressable)),
            _ => None,
        }
    }

    fn field_names(&self) -> &'static [&'static str] {
        &["method_steps", "collection_criteria"]
    }
}

/// Full description of one solver run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessModel {
    pub product: Product,
    pub column: Column,
    pub method: Method,
    pub binding_model: BindingModel,
    pub transport_model: TransportModel,
}

impl ProcessModel {
    pub fn new(product: Product, column: Column, method: Method) -> KrResult<Self> {
        if product.component_names.is_empty() {
            return Err(validation_error!("Product {} has no components", product.name));
        }
        let n = product.num_components();
        Ok(Self {
            product,
            column,
            method,
            binding_model: BindingModel::steric_mass_action(n),
            transport_model: TransportModel::general_rate(n),
        })
    }

    pub fn with_binding_model(mut self, binding_model: BindingModel) -> KrResult<Self> {
        if binding_model.num_components() != self.product.num_components() {
            return Err(validation_error!(
                "Binding model covers {} component(s), product {} has {}",
                binding_model.num_components(),
                self.product.name,
                self.product.num_components()
            ));
        }
        self.binding_model = binding_model;
        Ok(self)
    }
}

impl Addressable for ProcessModel {
    fn field(&self, name: &str) -> Option<FieldRef<'_>> {
        match name {
            "column" => Some(FieldRef::Node(&self.column)),
            "method" => Some(FieldRef::Node(&self.method)),
            "binding_model" => Some(FieldRef::Node(&self.binding_model)),
            "transport_model" => Some(FieldRef::Node(&self.transport_model)),
            _ => None,
        }
    }

    fn field_mut(&mut self, name: &str) -> Option<FieldMut<'_>> {
        match name {
            "column" => Some(FieldMut::Node(&mut self.column)),
            "method" => Some(FieldMut::Node(&mut self.method)),
            "binding_model" => Some(FieldMut::Node(&mut self.binding_model)),
            "transport_model" => Some(FieldMut::Node(&mut self.transport_model)),
            _ => None,
        }
    }

    fn field_names(&self) -> &'static [&'static str] {
        &["column", "method", "binding_model", "transport_model"]
    }
}
