tonic::include_proto!("segmentation");

pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("segmentation");
