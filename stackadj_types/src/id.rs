use index_vec::define_index_type;

define_index_type!{pub struct FragmentId = u32;}
// sites are numbered per tracker, in instrumentation order
define_index_type!{pub struct SiteId = u32;}
