// Engine modules: asset loading and sprite rendering

pub mod assets;
pub mod renderer;
