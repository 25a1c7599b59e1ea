pub mod descriptor_kind;
