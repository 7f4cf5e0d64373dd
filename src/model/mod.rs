pub mod aux_loss;
pub mod balanced;
pub mod dispatch;
pub mod experts;
pub mod flat;
pub mod gate;
pub mod hierarchical;
pub mod layer;
pub mod layout;
pub mod post_routing;
pub mod router;
pub mod strategy;
